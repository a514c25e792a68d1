//! Cube serialization to and from NetCDF files.
//!
//! Coordinates sharing a dimension name become coordinate variables
//! (f64, or i64 epoch seconds for time), data variables are f32.
//! Attributes must be flattened to scalars before writing; the writer
//! stage takes care of that.

use std::path::Path;

use chrono::DateTime;
use serde_json::{Map, Value};

use cube_common::{Coord, Crs, CubeError, CubeResult, DataCube, EvalContext, LazyArray, Variable};

const TIME_UNITS: &str = "seconds since 1970-01-01T00:00:00Z";

/// Write a materializable cube to a NetCDF file at `path`.
pub fn write_cube(path: &Path, cube: &DataCube, data_id: &str, ctx: &EvalContext) -> CubeResult<()> {
    let err = |message: String| CubeError::Write {
        data_id: data_id.to_string(),
        message,
    };

    let mut file = netcdf::create(path).map_err(|e| err(e.to_string()))?;

    for (dim, len) in &cube.dims {
        file.add_dimension(dim, *len).map_err(|e| err(e.to_string()))?;
    }

    for (name, coord) in &cube.coords {
        // Only coordinates backing a dimension become variables.
        if cube.dim_len(name).is_none() {
            continue;
        }
        match coord {
            Coord::Numeric(values) => {
                let mut var = file
                    .add_variable::<f64>(name, &[name])
                    .map_err(|e| err(e.to_string()))?;
                var.put_values(values.as_slice(), ..)
                    .map_err(|e| err(e.to_string()))?;
            }
            Coord::Time(values) => {
                let seconds: Vec<i64> = values.iter().map(|t| t.timestamp()).collect();
                let mut var = file
                    .add_variable::<i64>(name, &[name])
                    .map_err(|e| err(e.to_string()))?;
                var.put_values(seconds.as_slice(), ..)
                    .map_err(|e| err(e.to_string()))?;
                var.put_attribute("units", TIME_UNITS)
                    .map_err(|e| err(e.to_string()))?;
                var.put_attribute("calendar", "proleptic_gregorian")
                    .map_err(|e| err(e.to_string()))?;
            }
        }
    }

    for (name, variable) in &cube.vars {
        let dims: Vec<&str> = variable.dims.iter().map(String::as_str).collect();
        let mut var = file
            .add_variable::<f32>(name, &dims)
            .map_err(|e| err(e.to_string()))?;
        let values = variable.array.values(ctx)?;
        var.put_values(values.as_slice(), ..)
            .map_err(|e| err(e.to_string()))?;
        for (key, value) in &variable.attrs {
            var.put_attribute(key, attr_value(value))
                .map_err(|e| err(e.to_string()))?;
        }
    }

    for (key, value) in &cube.attrs {
        file.add_attribute(key, attr_value(value))
            .map_err(|e| err(e.to_string()))?;
    }
    Ok(())
}

/// Read a cube previously written by [`write_cube`].
pub fn read_cube(path: &Path, store_name: &str, data_id: &str) -> CubeResult<DataCube> {
    let err = |message: String| CubeError::SourceAccess {
        store: store_name.to_string(),
        data_id: data_id.to_string(),
        message,
    };

    let file = netcdf::open(path).map_err(|e| err(e.to_string()))?;

    let mut cube = DataCube::default();
    for dim in file.dimensions() {
        cube.dims.push((dim.name(), dim.len()));
    }

    for var in file.variables() {
        let name = var.name();
        if cube.dim_len(&name).is_some() {
            let units = string_attr(&var, "units");
            if name == "time" || units.as_deref().map(is_epoch_units).unwrap_or(false) {
                let seconds: Vec<i64> = var.get_values(..).map_err(|e| err(e.to_string()))?;
                let times = seconds
                    .iter()
                    .map(|&s| {
                        DateTime::from_timestamp(s, 0)
                            .ok_or_else(|| err(format!("invalid timestamp {s}")))
                    })
                    .collect::<CubeResult<Vec<_>>>()?;
                cube.coords.insert(name, Coord::time(times));
            } else {
                let values: Vec<f64> = var.get_values(..).map_err(|e| err(e.to_string()))?;
                cube.coords.insert(name, Coord::numeric(values));
            }
        } else {
            let dims: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
            let shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
            let values: Vec<f32> = var.get_values(..).map_err(|e| err(e.to_string()))?;
            let mut attrs = Map::new();
            for attr in var.attributes() {
                if let Ok(value) = attr.value() {
                    attrs.insert(attr.name().to_string(), json_attr(&value));
                }
            }
            cube.vars.insert(
                name,
                Variable {
                    dims,
                    array: LazyArray::from_values(shape, values)?,
                    attrs,
                },
            );
        }
    }

    for attr in file.attributes() {
        if let Ok(value) = attr.value() {
            cube.attrs.insert(attr.name().to_string(), json_attr(&value));
        }
    }
    if let Some(Value::String(s)) = cube.attrs.get("spatial_ref") {
        cube.crs = Crs::from_user_input(s).ok();
    }
    Ok(cube)
}

fn is_epoch_units(units: &str) -> bool {
    units.starts_with("seconds since 1970-01-01")
}

fn string_attr(var: &netcdf::Variable, name: &str) -> Option<String> {
    let attr = var.attributes().find(|a| a.name() == name)?;
    match attr.value().ok()? {
        netcdf::AttributeValue::Str(s) => Some(s),
        _ => None,
    }
}

/// Map a (pre-flattened) JSON attribute onto a NetCDF attribute value.
fn attr_value(value: &Value) -> netcdf::AttributeValue {
    match value {
        Value::String(s) => s.clone().into(),
        Value::Bool(b) => i32::from(*b).into(),
        Value::Number(n) if n.is_i64() => n.as_i64().unwrap_or_default().into(),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN).into(),
        other => other.to_string().into(),
    }
}

fn json_attr(value: &netcdf::AttributeValue) -> Value {
    use netcdf::AttributeValue as A;
    match value {
        A::Str(s) => Value::String(s.clone()),
        A::Schar(v) => Value::from(*v),
        A::Uchar(v) => Value::from(*v),
        A::Short(v) => Value::from(*v),
        A::Ushort(v) => Value::from(*v),
        A::Int(v) => Value::from(*v),
        A::Uint(v) => Value::from(*v),
        A::Longlong(v) => Value::from(*v),
        A::Ulonglong(v) => Value::from(*v),
        A::Float(v) => Value::from(*v),
        A::Double(v) => Value::from(*v),
        other => Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_netcdf_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sm.nc");
        let cube = test_utils::sample_cube(6, 4, 2)
            .cleaned()
            .with_attrs_flattened();

        let ctx = EvalContext::sequential();
        write_cube(&path, &cube, "sm.nc", &ctx).unwrap();
        let read = read_cube(&path, "local", "sm.nc").unwrap();

        assert_eq!(read.dims, cube.dims);
        assert_eq!(read.crs, cube.crs);
        assert!(read.coords["time"].bit_identical(&cube.coords["time"]));
        assert!(read.coords["y"].bit_identical(&cube.coords["y"]));
        let original = cube.vars["sm"].array.values(&ctx).unwrap();
        let roundtripped = read.vars["sm"].array.values(&ctx).unwrap();
        assert_eq!(original.as_ref(), roundtripped.as_ref());
        assert_eq!(read.attrs["spatial_ref"], json!("EPSG:4326"));
    }
}
