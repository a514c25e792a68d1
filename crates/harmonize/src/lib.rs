//! Harmonization of source cubes onto a target grid mapping.
//!
//! Grid mode reprojects, resamples, and clips a cube onto a configured
//! grid; point mode extracts a time series or a small cutout around a
//! single location; fusion merges harmonized single-variable cubes into
//! one multi-variable cube with exactly matching coordinates.

pub mod fuse;
pub mod point;
pub mod resample;

pub use fuse::fuse;
pub use point::{extract_point, PointParams};
pub use resample::{harmonize_to_grid, ResampleMethod};
