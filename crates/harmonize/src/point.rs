//! Point-mode extraction: time series or small cutouts at one location.

use cube_common::{
    BoundingBox, Coord, CubeError, CubeResult, Crs, DataCube, LazyArray, Transformer, Variable,
};

use crate::resample::{bilinear_sample, ResampleMethod};

/// A point of interest in WGS84, with an optional square neighborhood
/// given as the bounding-box edge length in the source CRS's units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointParams {
    pub lat: f64,
    pub lon: f64,
    pub neighborhood: f64,
}

/// Extract data at a point.
///
/// With a zero neighborhood the result is a time series (or scalar)
/// interpolated at the point; a positive neighborhood instead clips the
/// cube to a square window centered on the point.
pub fn extract_point(
    cube: &DataCube,
    params: &PointParams,
    method: ResampleMethod,
) -> CubeResult<DataCube> {
    let crs = cube
        .crs
        .ok_or_else(|| CubeError::Harmonize("source cube has no CRS".to_string()))?;
    let to_src = Transformer::new(Crs::WGS84, crs)?;
    let (x, y) = to_src.transform(params.lon, params.lat)?;

    if params.neighborhood > 0.0 {
        // neighborhood is the box edge length, around_point takes the half-size
        let bbox = BoundingBox::around_point(x, y, params.neighborhood / 2.0);
        return cube.clip_bbox(&bbox);
    }

    let x_name = cube
        .x_dim()
        .ok_or_else(|| CubeError::Harmonize("cube has no x dimension".to_string()))?
        .to_string();
    let y_name = cube
        .y_dim()
        .ok_or_else(|| CubeError::Harmonize("cube has no y dimension".to_string()))?
        .to_string();
    let src_x = numeric(cube, &x_name)?;
    let src_y = numeric(cube, &y_name)?;
    let (fx, in_x) = fractional_index(&src_x, x);
    let (fy, in_y) = fractional_index(&src_y, y);
    if !in_x || !in_y {
        return Err(CubeError::Harmonize(format!(
            "point ({}, {}) lies outside the source extent",
            params.lon, params.lat
        )));
    }

    let time_len = cube.time_len();
    let mut out = DataCube {
        attrs: cube.attrs.clone(),
        crs: Some(crs),
        ..Default::default()
    };
    out.coords.insert(x_name.clone(), Coord::numeric(vec![x]));
    out.coords.insert(y_name.clone(), Coord::numeric(vec![y]));
    if let Some(time) = cube.coords.get("time") {
        out.coords.insert("time".to_string(), time.clone());
    }
    out.dims = match time_len {
        Some(t) => vec![("time".to_string(), t)],
        None => Vec::new(),
    };

    let (sw, sh) = (src_x.len(), src_y.len());
    for (name, var) in &cube.vars {
        if !var.dims.contains(&x_name) || !var.dims.contains(&y_name) {
            continue;
        }
        let has_time = var.dims.contains(&"time".to_string());
        let steps = if has_time { time_len.unwrap_or(1) } else { 1 };
        let out_shape = if has_time { vec![steps] } else { Vec::new() };
        let out_dims = if has_time {
            vec!["time".to_string()]
        } else {
            Vec::new()
        };

        let parent = var.array.clone();
        let array = LazyArray::deferred(out_shape, move |ctx| {
            let data = parent.values(ctx)?;
            let plane = sw * sh;
            let mut values = Vec::with_capacity(steps);
            for t in 0..steps {
                let step = &data[t * plane..(t + 1) * plane];
                let v = match method {
                    ResampleMethod::Bilinear => bilinear_sample(step, sw, sh, fx, fy, f32::NAN),
                    ResampleMethod::Nearest => {
                        let i = fx.round() as usize;
                        let j = fy.round() as usize;
                        step[j.min(sh - 1) * sw + i.min(sw - 1)]
                    }
                };
                values.push(v);
            }
            Ok(values)
        });

        out.vars.insert(
            name.clone(),
            Variable {
                dims: out_dims,
                array,
                attrs: var.attrs.clone(),
            },
        );
    }
    Ok(out)
}

fn numeric(cube: &DataCube, name: &str) -> CubeResult<Vec<f64>> {
    match cube.coords.get(name) {
        Some(Coord::Numeric(v)) => Ok(v.as_ref().clone()),
        _ => Err(CubeError::Harmonize(format!(
            "missing numeric coordinate '{name}'"
        ))),
    }
}

/// Fractional index of `value` along a monotonic coordinate, plus whether
/// it falls within the coordinate's cell coverage.
fn fractional_index(values: &[f64], value: f64) -> (f64, bool) {
    if values.len() < 2 {
        let inside = !values.is_empty() && (value - values[0]).abs() < f64::EPSILON;
        return (0.0, inside);
    }
    let step = values[1] - values[0];
    let f = (value - values[0]) / step;
    let inside = f >= -0.5 && f <= values.len() as f64 - 0.5;
    (f, inside)
}
