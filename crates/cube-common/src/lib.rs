//! Shared types for the cubegen workspace.
//!
//! This crate defines the spatial primitives (bounding boxes, coordinate
//! reference systems, grid mappings), the in-memory data cube model with
//! lazy array evaluation, and the error taxonomy used across all cubegen
//! crates.

pub mod bbox;
pub mod crs;
pub mod cube;
pub mod error;
pub mod grid;

pub use bbox::BoundingBox;
pub use crs::{Crs, Transformer};
pub use cube::{Coord, DataCube, EvalContext, LazyArray, Variable};
pub use error::{CubeError, CubeResult};
pub use grid::{GridMapping, DEFAULT_TILE_SIZE};
