//! Fusion of harmonized single-variable cubes into one cube.

use tracing::debug;

use cube_common::{CubeError, CubeResult, DataCube};

/// Merge cubes that share an identical grid into one multi-variable cube.
///
/// The join is exact: dimensions and coordinates must match bit for bit,
/// and variable names must not collide. Global attributes are unioned;
/// keys with conflicting values are dropped.
pub fn fuse(cubes: Vec<DataCube>) -> CubeResult<DataCube> {
    let mut iter = cubes.into_iter();
    let mut out = iter
        .next()
        .ok_or_else(|| CubeError::Fusion("nothing to fuse".to_string()))?;

    for cube in iter {
        if cube.dims != out.dims {
            return Err(CubeError::Fusion(format!(
                "dimension mismatch: {:?} vs {:?}",
                out.dims, cube.dims
            )));
        }
        if cube.crs != out.crs {
            return Err(CubeError::Fusion(format!(
                "CRS mismatch: {:?} vs {:?}",
                out.crs, cube.crs
            )));
        }
        for (name, coord) in &out.coords {
            let other = cube.coords.get(name).ok_or_else(|| {
                CubeError::Fusion(format!("coordinate '{name}' missing from fused input"))
            })?;
            if !coord.bit_identical(other) {
                return Err(CubeError::Fusion(format!(
                    "coordinate '{name}' differs between fused inputs"
                )));
            }
        }

        for (name, var) in cube.vars {
            if out.vars.contains_key(&name) {
                return Err(CubeError::Fusion(format!(
                    "variable '{name}' appears in more than one fused input"
                )));
            }
            out.vars.insert(name, var);
        }

        // union attrs, dropping keys whose values conflict
        for (key, value) in cube.attrs {
            match out.attrs.get(&key) {
                None => {
                    out.attrs.insert(key, value);
                }
                Some(existing) if *existing == value => {}
                Some(_) => {
                    debug!(attr = %key, "dropping conflicting attribute during fusion");
                    out.attrs.remove(&key);
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_utils::sample_cube_named;

    #[test]
    fn test_fuse_two_variables() {
        let a = sample_cube_named("sm", 5, 5, 2);
        let b = sample_cube_named("lst", 5, 5, 2);
        let fused = fuse(vec![a, b]).unwrap();
        assert_eq!(fused.vars.len(), 2);
        assert!(fused.vars.contains_key("sm"));
        assert!(fused.vars.contains_key("lst"));
    }

    #[test]
    fn test_variable_collision_is_error() {
        let a = sample_cube_named("sm", 5, 5, 2);
        let b = sample_cube_named("sm", 5, 5, 2);
        assert!(matches!(fuse(vec![a, b]), Err(CubeError::Fusion(_))));
    }

    #[test]
    fn test_grid_mismatch_is_error() {
        let a = sample_cube_named("sm", 5, 5, 2);
        let b = sample_cube_named("lst", 6, 5, 2);
        assert!(matches!(fuse(vec![a, b]), Err(CubeError::Fusion(_))));
    }

    #[test]
    fn test_coordinate_mismatch_is_error() {
        let a = sample_cube_named("sm", 5, 5, 2);
        let mut b = sample_cube_named("lst", 5, 5, 2);
        b.coords.insert(
            "x".to_string(),
            cube_common::Coord::numeric(vec![9.0, 9.1, 9.2, 9.3, 9.4]),
        );
        assert!(matches!(fuse(vec![a, b]), Err(CubeError::Fusion(_))));
    }

    #[test]
    fn test_conflicting_attrs_dropped() {
        let mut a = sample_cube_named("sm", 4, 4, 1);
        let mut b = sample_cube_named("lst", 4, 4, 1);
        a.attrs.insert("institution".to_string(), json!("esa"));
        b.attrs.insert("institution".to_string(), json!("nasa"));
        a.attrs.insert("license".to_string(), json!("cc-by"));

        let fused = fuse(vec![a, b]).unwrap();
        assert!(!fused.attrs.contains_key("institution"));
        assert_eq!(fused.attrs["license"], json!("cc-by"));
        // identical values survive
        assert_eq!(fused.attrs["source"], json!("test"));
    }

    #[test]
    fn test_empty_input_is_error() {
        assert!(fuse(Vec::new()).is_err());
    }
}
