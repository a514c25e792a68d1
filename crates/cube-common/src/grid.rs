//! Target grid mapping: CRS, extent, resolution, and tiling.

use serde::{Deserialize, Serialize};

use crate::bbox::BoundingBox;
use crate::crs::Crs;
use crate::cube::{Coord, DataCube};
use crate::error::{CubeError, CubeResult};

/// Default chunk edge length for generated cubes.
pub const DEFAULT_TILE_SIZE: usize = 1024;

/// A fully resolved target grid: CRS, bounding box, cell size, and the
/// chunk layout of the generated cube.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridMapping {
    pub crs: Crs,
    pub bbox: BoundingBox,
    pub spatial_res: f64,
    /// Chunk size as (width, height).
    pub tile_size: (usize, usize),
}

impl GridMapping {
    /// Create a grid mapping, validating resolution and tile size.
    pub fn new(
        crs: Crs,
        bbox: BoundingBox,
        spatial_res: f64,
        tile_size: (usize, usize),
    ) -> CubeResult<Self> {
        if !(spatial_res > 0.0) {
            return Err(CubeError::Config(format!(
                "spatial_res must be positive, got {spatial_res}"
            )));
        }
        if bbox.width() <= 0.0 || bbox.height() <= 0.0 {
            return Err(CubeError::Config(format!("degenerate bbox {bbox:?}")));
        }
        if tile_size.0 == 0 || tile_size.1 == 0 {
            return Err(CubeError::Config(format!(
                "tile_size must be positive, got {tile_size:?}"
            )));
        }
        Ok(Self {
            crs,
            bbox,
            spatial_res,
            tile_size,
        })
    }

    /// Number of grid cells along x.
    pub fn width(&self) -> usize {
        (self.bbox.width() / self.spatial_res).round().max(1.0) as usize
    }

    /// Number of grid cells along y.
    pub fn height(&self) -> usize {
        (self.bbox.height() / self.spatial_res).round().max(1.0) as usize
    }

    /// Cell-center x coordinates, ascending west to east.
    pub fn x_coords(&self) -> Vec<f64> {
        (0..self.width())
            .map(|i| self.bbox.min_x + (i as f64 + 0.5) * self.spatial_res)
            .collect()
    }

    /// Cell-center y coordinates, descending north to south.
    pub fn y_coords(&self) -> Vec<f64> {
        (0..self.height())
            .map(|j| self.bbox.max_y - (j as f64 + 0.5) * self.spatial_res)
            .collect()
    }

    /// Derive a grid mapping from a cube's native coordinates.
    ///
    /// Requires an attached CRS and evenly spaced spatial coordinates;
    /// used when a dataset names another dataset as its grid reference.
    pub fn from_cube(cube: &DataCube) -> CubeResult<Self> {
        let crs = cube
            .crs
            .ok_or_else(|| CubeError::Harmonize("cube has no CRS attached".to_string()))?;
        let x = numeric_coord(cube, &["x", "lon"])?;
        let y = numeric_coord(cube, &["y", "lat"])?;
        if x.len() < 2 || y.len() < 2 {
            return Err(CubeError::Harmonize(
                "cannot derive a grid from a single-cell axis".to_string(),
            ));
        }

        let res_x = (x[1] - x[0]).abs();
        let res_y = (y[1] - y[0]).abs();
        if !(res_x > 0.0) || (res_x - res_y).abs() > 1e-9 * res_x.max(res_y) {
            return Err(CubeError::Harmonize(format!(
                "non-square cell size ({res_x} x {res_y})"
            )));
        }

        let (x_min, x_max) = (x[0].min(x[x.len() - 1]), x[0].max(x[x.len() - 1]));
        let (y_min, y_max) = (y[0].min(y[y.len() - 1]), y[0].max(y[y.len() - 1]));
        // Coordinates are cell centers; extend by half a cell to edges.
        let bbox = BoundingBox::new(
            x_min - res_x / 2.0,
            y_min - res_x / 2.0,
            x_max + res_x / 2.0,
            y_max + res_x / 2.0,
        );
        Self::new(crs, bbox, res_x, (DEFAULT_TILE_SIZE, DEFAULT_TILE_SIZE))
    }
}

fn numeric_coord(cube: &DataCube, names: &[&str]) -> CubeResult<Vec<f64>> {
    for name in names {
        if let Some(Coord::Numeric(values)) = cube.coords.get(*name) {
            return Ok(values.as_ref().clone());
        }
    }
    Err(CubeError::Harmonize(format!(
        "cube has no {} coordinate",
        names.join("/")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> GridMapping {
        GridMapping::new(
            Crs::WGS84,
            BoundingBox::new(0.0, 40.0, 10.0, 50.0),
            0.5,
            (1024, 1024),
        )
        .unwrap()
    }

    #[test]
    fn test_grid_size() {
        let g = grid();
        assert_eq!(g.width(), 20);
        assert_eq!(g.height(), 20);
    }

    #[test]
    fn test_cell_center_coords() {
        let g = grid();
        let x = g.x_coords();
        let y = g.y_coords();
        assert_eq!(x.len(), 20);
        assert_eq!(x[0], 0.25);
        assert_eq!(x[19], 9.75);
        // y runs north to south
        assert_eq!(y[0], 49.75);
        assert_eq!(y[19], 40.25);
    }

    #[test]
    fn test_invalid_grid_rejected() {
        let bbox = BoundingBox::new(0.0, 40.0, 10.0, 50.0);
        assert!(GridMapping::new(Crs::WGS84, bbox, 0.0, (1024, 1024)).is_err());
        assert!(GridMapping::new(Crs::WGS84, bbox, 0.5, (0, 1024)).is_err());
        let degenerate = BoundingBox::new(10.0, 40.0, 10.0, 50.0);
        assert!(GridMapping::new(Crs::WGS84, degenerate, 0.5, (1024, 1024)).is_err());
    }

    #[test]
    fn test_from_cube_roundtrip() {
        let g = grid();
        let cube = crate::cube::DataCube::from_grid_for_tests(&g);
        let derived = GridMapping::from_cube(&cube).unwrap();
        assert_eq!(derived.crs, g.crs);
        assert!((derived.spatial_res - g.spatial_res).abs() < 1e-12);
        assert!((derived.bbox.min_x - g.bbox.min_x).abs() < 1e-9);
        assert!((derived.bbox.max_y - g.bbox.max_y).abs() < 1e-9);
    }
}
