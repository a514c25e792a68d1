//! Grid-mode harmonization: reproject, resample, and clip a cube onto a
//! target grid mapping.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use cube_common::{
    Coord, Crs, CubeError, CubeResult, DataCube, GridMapping, LazyArray, Transformer, Variable,
};

/// Resampling kernel used when mapping source cells onto the target grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleMethod {
    #[default]
    Bilinear,
    Nearest,
}

/// Resample `cube` onto `target`.
///
/// The target extent is transformed into the source CRS and padded by two
/// source cells so interpolation at the edges has support, the source is
/// clipped to that footprint, and each variable becomes a deferred
/// per-time-step resample. Cells without source coverage receive
/// `fill_value`. A source that does not overlap the target extent at all
/// is an error.
pub fn harmonize_to_grid(
    cube: &DataCube,
    target: &GridMapping,
    method: ResampleMethod,
    fill_value: f32,
) -> CubeResult<DataCube> {
    let src_crs = cube
        .crs
        .ok_or_else(|| CubeError::Harmonize("source cube has no CRS".to_string()))?;
    let (src_x, src_y) = spatial_coords(cube)?;
    let src_res = spacing(&src_x)
        .or_else(|| spacing(&src_y))
        .ok_or_else(|| CubeError::Harmonize("source grid has no measurable cell size".to_string()))?;
    let src_extent = extent_of(&src_x, &src_y, src_res);

    let to_src = Transformer::new(target.crs, src_crs)?;
    let target_in_src = to_src.transform_bbox(&target.bbox)?;
    if !target_in_src.intersects(&src_extent) {
        return Err(CubeError::EmptyIntersection {
            source_extent: src_extent,
            target: target_in_src,
        });
    }
    let footprint = target_in_src
        .pad(2.0 * src_res)
        .intersection(&src_extent)
        .ok_or(CubeError::EmptyIntersection {
            source_extent: src_extent,
            target: target_in_src,
        })?;
    let clipped = cube.clip_bbox(&footprint)?;
    let (clip_x, clip_y) = spatial_coords(&clipped)?;
    let clip_x = Arc::new(clip_x);
    let clip_y = Arc::new(clip_y);
    debug!(
        source_cells = clip_x.len() * clip_y.len(),
        target_cells = target.width() * target.height(),
        "resampling clipped source onto target grid"
    );

    let (out_w, out_h) = (target.width(), target.height());
    let mut out = DataCube {
        attrs: cube.attrs.clone(),
        crs: Some(target.crs),
        ..Default::default()
    };
    if let Some(time) = clipped.coords.get("time") {
        out.coords.insert("time".to_string(), time.clone());
    }
    out.coords
        .insert("x".to_string(), Coord::numeric(target.x_coords()));
    out.coords
        .insert("y".to_string(), Coord::numeric(target.y_coords()));

    let time_len = clipped.time_len();
    out.dims = match time_len {
        Some(t) => vec![
            ("time".to_string(), t),
            ("y".to_string(), out_h),
            ("x".to_string(), out_w),
        ],
        None => vec![("y".to_string(), out_h), ("x".to_string(), out_w)],
    };
    let mut chunks = HashMap::from([
        ("y".to_string(), target.tile_size.1),
        ("x".to_string(), target.tile_size.0),
    ]);
    if time_len.is_some() {
        // one time step per chunk in the generated cube
        chunks.insert("time".to_string(), 1);
    }
    out.chunks = Some(chunks);

    let x_dim = cube.x_dim().map(str::to_string).unwrap_or_default();
    let y_dim = cube.y_dim().map(str::to_string).unwrap_or_default();
    for (name, var) in &clipped.vars {
        if !var.dims.contains(&x_dim) || !var.dims.contains(&y_dim) {
            debug!(variable = %name, "skipping non-spatial variable");
            continue;
        }
        let has_time = var.dims.contains(&"time".to_string());
        let steps = if has_time { time_len.unwrap_or(1) } else { 1 };

        let out_shape = if has_time {
            vec![steps, out_h, out_w]
        } else {
            vec![out_h, out_w]
        };
        let array = resampled_array(
            var.array.clone(),
            Arc::clone(&clip_x),
            Arc::clone(&clip_y),
            *target,
            src_crs,
            method,
            fill_value,
            steps,
            out_shape,
        );
        let out_dims = if has_time {
            vec!["time".to_string(), "y".to_string(), "x".to_string()]
        } else {
            vec!["y".to_string(), "x".to_string()]
        };
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

#[allow(clippy::too_many_arguments)]
fn resampled_array(
    parent: LazyArray,
    src_x: Arc<Vec<f64>>,
    src_y: Arc<Vec<f64>>,
    target: GridMapping,
    src_crs: Crs,
    method: ResampleMethod,
    fill_value: f32,
    steps: usize,
    out_shape: Vec<usize>,
) -> LazyArray {
    LazyArray::deferred(out_shape, move |ctx| {
        let to_src = Transformer::new(target.crs, src_crs)?;
        let mapping = source_indices(&to_src, &target, &src_x, &src_y);
        let (sw, sh) = (src_x.len(), src_y.len());
        let plane = sw * sh;

        let src_data = parent.values(ctx)?;
        let planes = ctx.map_steps(steps, |t| {
            let step = &src_data[t * plane..(t + 1) * plane];
            Ok(resample_plane(step, sw, sh, &mapping, method, fill_value))
        })?;
        Ok(planes.concat())
    })
}

/// Fractional source grid indices of every target cell center, row-major
/// over the target grid. Cells the projection cannot map become NaN.
fn source_indices(
    to_src: &Transformer,
    target: &GridMapping,
    src_x: &[f64],
    src_y: &[f64],
) -> Vec<(f64, f64)> {
    let step_x = spacing_signed(src_x);
    let step_y = spacing_signed(src_y);
    let xs = target.x_coords();
    let ys = target.y_coords();

    let mut mapping = Vec::with_capacity(xs.len() * ys.len());
    for &ty in &ys {
        for &tx in &xs {
            match to_src.transform(tx, ty) {
                Ok((sx, sy)) => {
                    let fx = (sx - src_x[0]) / step_x;
                    let fy = (sy - src_y[0]) / step_y;
                    mapping.push((fx, fy));
                }
                Err(_) => mapping.push((f64::NAN, f64::NAN)),
            }
        }
    }
    mapping
}

fn resample_plane(
    src: &[f32],
    sw: usize,
    sh: usize,
    mapping: &[(f64, f64)],
    method: ResampleMethod,
    fill_value: f32,
) -> Vec<f32> {
    mapping
        .iter()
        .map(|&(fx, fy)| {
            if !fx.is_finite() || !fy.is_finite() {
                return fill_value;
            }
            match method {
                ResampleMethod::Nearest => nearest_sample(src, sw, sh, fx, fy, fill_value),
                ResampleMethod::Bilinear => bilinear_sample(src, sw, sh, fx, fy, fill_value),
            }
        })
        .collect()
}

fn nearest_sample(src: &[f32], sw: usize, sh: usize, fx: f64, fy: f64, fill_value: f32) -> f32 {
    let i = fx.round();
    let j = fy.round();
    if i < 0.0 || j < 0.0 || i >= sw as f64 || j >= sh as f64 {
        return fill_value;
    }
    let v = src[j as usize * sw + i as usize];
    if v.is_nan() {
        fill_value
    } else {
        v
    }
}

pub(crate) fn bilinear_sample(
    src: &[f32],
    sw: usize,
    sh: usize,
    fx: f64,
    fy: f64,
    fill_value: f32,
) -> f32 {
    if fx < -0.5 || fy < -0.5 || fx > sw as f64 - 0.5 || fy > sh as f64 - 0.5 {
        return fill_value;
    }
    let fx = fx.clamp(0.0, (sw - 1) as f64);
    let fy = fy.clamp(0.0, (sh - 1) as f64);
    let x1 = fx.floor() as usize;
    let y1 = fy.floor() as usize;
    let x2 = (x1 + 1).min(sw - 1);
    let y2 = (y1 + 1).min(sh - 1);
    let dx = (fx - x1 as f64) as f32;
    let dy = (fy - y1 as f64) as f32;

    let v11 = src[y1 * sw + x1];
    let v21 = src[y1 * sw + x2];
    let v12 = src[y2 * sw + x1];
    let v22 = src[y2 * sw + x2];
    if v11.is_nan() || v21.is_nan() || v12.is_nan() || v22.is_nan() {
        return fill_value;
    }

    let top = v11 * (1.0 - dx) + v21 * dx;
    let bottom = v12 * (1.0 - dx) + v22 * dx;
    top * (1.0 - dy) + bottom * dy
}

fn spatial_coords(cube: &DataCube) -> CubeResult<(Vec<f64>, Vec<f64>)> {
    let x_name = cube
        .x_dim()
        .ok_or_else(|| CubeError::Harmonize("cube has no x dimension".to_string()))?;
    let y_name = cube
        .y_dim()
        .ok_or_else(|| CubeError::Harmonize("cube has no y dimension".to_string()))?;
    let get = |name: &str| match cube.coords.get(name) {
        Some(Coord::Numeric(v)) => Ok(v.as_ref().clone()),
        _ => Err(CubeError::Harmonize(format!(
            "missing numeric coordinate '{name}'"
        ))),
    };
    Ok((get(x_name)?, get(y_name)?))
}

fn spacing(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    Some((values[1] - values[0]).abs())
}

fn spacing_signed(values: &[f64]) -> f64 {
    if values.len() < 2 {
        1.0
    } else {
        values[1] - values[0]
    }
}

fn extent_of(x: &[f64], y: &[f64], res: f64) -> cube_common::BoundingBox {
    let (x_min, x_max) = min_max(x);
    let (y_min, y_max) = min_max(y);
    cube_common::BoundingBox::new(
        x_min - res / 2.0,
        y_min - res / 2.0,
        x_max + res / 2.0,
        y_max + res / 2.0,
    )
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_common::{BoundingBox, EvalContext};
    use test_utils::{sample_cube, sample_grid};

    #[test]
    fn test_identity_resample_preserves_values() {
        let cube = sample_cube(8, 6, 2);
        let target = sample_grid(8, 6);
        let out = harmonize_to_grid(&cube, &target, ResampleMethod::Bilinear, f32::NAN).unwrap();

        assert_eq!(out.dims, cube.dims);
        assert!(!out.vars["sm"].array.is_materialized());

        let ctx = EvalContext::sequential();
        let original = cube.vars["sm"].array.values(&ctx).unwrap();
        let resampled = out.vars["sm"].array.values(&ctx).unwrap();
        for (a, b) in original.iter().zip(resampled.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn test_output_geometry_follows_target() {
        let cube = sample_cube(10, 10, 1);
        let target = GridMapping::new(
            cube.crs.unwrap(),
            BoundingBox::new(2.0, 42.0, 8.0, 48.0),
            0.5,
            (256, 128),
        )
        .unwrap();
        let out = harmonize_to_grid(&cube, &target, ResampleMethod::Bilinear, f32::NAN).unwrap();

        assert_eq!(out.dim_len("x"), Some(12));
        assert_eq!(out.dim_len("y"), Some(12));
        assert_eq!(out.crs, Some(target.crs));
        let chunks = out.chunks.as_ref().unwrap();
        assert_eq!(chunks["time"], 1);
        assert_eq!(chunks["x"], 256);
        assert_eq!(chunks["y"], 128);
        match out.coords.get("x").unwrap() {
            Coord::Numeric(v) => assert_eq!(v[0], 2.25),
            _ => panic!("expected numeric x"),
        }
    }

    #[test]
    fn test_nearest_and_bilinear_agree_on_centers() {
        let cube = sample_cube(6, 6, 1);
        let target = sample_grid(6, 6);
        let ctx = EvalContext::sequential();
        let near = harmonize_to_grid(&cube, &target, ResampleMethod::Nearest, f32::NAN).unwrap();
        let bili = harmonize_to_grid(&cube, &target, ResampleMethod::Bilinear, f32::NAN).unwrap();
        let a = near.vars["sm"].array.values(&ctx).unwrap();
        let b = bili.vars["sm"].array.values(&ctx).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-3);
        }
    }

    #[test]
    fn test_disjoint_extents_error() {
        let cube = sample_cube(4, 4, 0);
        let target = GridMapping::new(
            cube.crs.unwrap(),
            BoundingBox::new(100.0, -50.0, 110.0, -40.0),
            0.5,
            (256, 256),
        )
        .unwrap();
        let err = harmonize_to_grid(&cube, &target, ResampleMethod::Bilinear, f32::NAN).unwrap_err();
        assert!(matches!(err, CubeError::EmptyIntersection { .. }));
    }

    #[test]
    fn test_fill_value_outside_coverage() {
        // target extends east of the source extent
        let cube = sample_cube(4, 4, 0);
        let target = GridMapping::new(
            cube.crs.unwrap(),
            BoundingBox::new(0.0, 40.0, 8.0, 44.0),
            1.0,
            (256, 256),
        )
        .unwrap();
        let out = harmonize_to_grid(&cube, &target, ResampleMethod::Bilinear, -999.0).unwrap();
        let values = out
            .vars["sm"]
            .array
            .values(&EvalContext::sequential())
            .unwrap();
        // easternmost column has no source support
        assert_eq!(values[7], -999.0);
        // westernmost column does
        assert!(values[0] != -999.0);
    }

    #[test]
    fn test_bilinear_nan_corner_uses_fill() {
        let src = vec![1.0, f32::NAN, 2.0, 3.0];
        let v = bilinear_sample(&src, 2, 2, 0.5, 0.5, -1.0);
        assert_eq!(v, -1.0);
    }
}
