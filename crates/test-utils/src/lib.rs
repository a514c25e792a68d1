//! Shared test fixtures for the cubegen workspace.
//!
//! Provides deterministic sample cubes and grids so store, harmonizer,
//! and pipeline tests agree on geometry and values.
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../test-utils" }
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use cube_common::{
    BoundingBox, Coord, Crs, DataCube, GridMapping, LazyArray, Variable, DEFAULT_TILE_SIZE,
};

/// A 1-degree WGS84 grid anchored at (0, 40), `width` x `height` cells.
pub fn sample_grid(width: usize, height: usize) -> GridMapping {
    GridMapping::new(
        Crs::WGS84,
        BoundingBox::new(0.0, 40.0, width as f64, 40.0 + height as f64),
        1.0,
        (DEFAULT_TILE_SIZE, DEFAULT_TILE_SIZE),
    )
    .expect("valid sample grid")
}

/// Daily timestamps starting 2024-01-01.
pub fn sample_times(n: usize) -> Vec<DateTime<Utc>> {
    (0..n)
        .map(|i| {
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::days(i as i64)
        })
        .collect()
}

/// A cube on [`sample_grid`] with one variable `"sm"` whose values are the
/// row-major element index as `f32` (offset by 1000 per time step).
///
/// `time_steps` of zero produces a cube without a time axis.
pub fn sample_cube(width: usize, height: usize, time_steps: usize) -> DataCube {
    sample_cube_named("sm", width, height, time_steps)
}

/// Like [`sample_cube`] with a caller-chosen variable name.
pub fn sample_cube_named(name: &str, width: usize, height: usize, time_steps: usize) -> DataCube {
    let grid = sample_grid(width, height);
    let spatial: Vec<f32> = (0..width * height).map(|i| i as f32).collect();

    let mut cube = DataCube {
        crs: Some(grid.crs),
        ..Default::default()
    };
    cube.coords
        .insert("x".to_string(), Coord::numeric(grid.x_coords()));
    cube.coords
        .insert("y".to_string(), Coord::numeric(grid.y_coords()));

    let (dims, shape, values) = if time_steps == 0 {
        (
            vec![("y".to_string(), height), ("x".to_string(), width)],
            vec![height, width],
            spatial,
        )
    } else {
        cube.coords
            .insert("time".to_string(), Coord::time(sample_times(time_steps)));
        let mut values = Vec::with_capacity(time_steps * spatial.len());
        for t in 0..time_steps {
            values.extend(spatial.iter().map(|v| v + 1000.0 * t as f32));
        }
        (
            vec![
                ("time".to_string(), time_steps),
                ("y".to_string(), height),
                ("x".to_string(), width),
            ],
            vec![time_steps, height, width],
            values,
        )
    };

    let var_dims: Vec<String> = dims.iter().map(|(n, _)| n.clone()).collect();
    cube.dims = dims;
    cube.vars.insert(
        name.to_string(),
        Variable {
            dims: var_dims,
            array: LazyArray::from_values(shape, values).expect("shape matches values"),
            attrs: serde_json::Map::from_iter([("units".to_string(), json!("m3/m3"))]),
        },
    );
    cube.attrs.insert("source".to_string(), json!("test"));
    cube
}
