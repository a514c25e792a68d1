//! Data store abstraction and concrete stores.
//!
//! A `DataStore` is the capability set the pipeline needs from a storage
//! backend: open a dataset by id, write a cube, check and delete existing
//! outputs, and optionally stage remote data ahead of opening (preload).
//! Concrete stores cover in-memory data (tests and fixtures), a local
//! filesystem directory holding Zarr and NetCDF datasets, and remote
//! single-file NetCDF over HTTP.

use async_trait::async_trait;
use serde_json::Value;

use cube_common::{BoundingBox, CubeError, CubeResult, DataCube, EvalContext};

pub mod http;
pub mod local;
pub mod memory;
mod netcdf_io;
pub mod preload;
pub mod registry;
mod zarr_io;

pub use http::HttpStore;
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use preload::{PreloadCoordinator, PreloadPolicy};
pub use registry::{new_data_store, StoreParams, StoreRegistry};

/// Free-form open parameters from the dataset configuration.
pub type OpenParams = serde_json::Map<String, Value>;

/// Staging state of one data id within a preload-capable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadStatus {
    NotRequested,
    Pending,
    Ready,
    Failed(String),
}

/// Capabilities the pipeline requires from a storage backend.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Configured identifier of this store, used in logs and errors.
    fn name(&self) -> &str;

    /// Open a dataset. Implementations honor the shared open parameters
    /// (see [`apply_open_params`]); extra keys are backend-specific.
    async fn open_data(&self, data_id: &str, params: &OpenParams) -> CubeResult<DataCube>;

    /// Write a cube under `data_id`, materializing lazy arrays via `ctx`.
    async fn write_data(&self, cube: &DataCube, data_id: &str, ctx: &EvalContext)
        -> CubeResult<()>;

    /// Remove a dataset if present. Missing data is not an error.
    async fn delete_data(&self, data_id: &str) -> CubeResult<()>;

    /// Whether `data_id` already exists in this store.
    async fn has_data(&self, data_id: &str) -> bool;

    /// Whether this store can stage remote data ahead of `open_data`.
    fn supports_preload(&self) -> bool {
        false
    }

    /// Begin staging the given data ids. `force` re-stages data that is
    /// already present.
    async fn preload(&self, data_ids: &[String], force: bool) -> CubeResult<()> {
        let _ = force;
        Err(CubeError::Preload {
            store: self.name().to_string(),
            data_id: data_ids.first().cloned().unwrap_or_default(),
            message: "store does not support preloading".to_string(),
        })
    }

    /// Poll the staging state of one data id.
    async fn preload_status(&self, data_id: &str) -> PreloadStatus {
        let _ = data_id;
        PreloadStatus::NotRequested
    }
}

/// Apply the open parameters shared by all stores: a `bbox`
/// (`[min_x, min_y, max_x, max_y]`) clips the opened cube spatially.
pub fn apply_open_params(cube: DataCube, params: &OpenParams) -> CubeResult<DataCube> {
    match params.get("bbox") {
        Some(value) => {
            let corners: [f64; 4] = serde_json::from_value(value.clone())
                .map_err(|e| CubeError::Config(format!("invalid bbox open parameter: {e}")))?;
            cube.clip_bbox(&BoundingBox::from_array(corners))
        }
        None => Ok(cube),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_bbox_open_param() {
        let cube = test_utils::sample_cube(10, 10, 1);
        let mut params = OpenParams::new();
        params.insert("bbox".to_string(), json!([2.0, 42.0, 6.0, 46.0]));
        let clipped = apply_open_params(cube, &params).unwrap();
        assert_eq!(clipped.dim_len("x"), Some(4));
        assert_eq!(clipped.dim_len("y"), Some(4));
    }

    #[test]
    fn test_malformed_bbox_param_is_config_error() {
        let cube = test_utils::sample_cube(4, 4, 1);
        let mut params = OpenParams::new();
        params.insert("bbox".to_string(), json!("not a bbox"));
        assert!(matches!(
            apply_open_params(cube, &params),
            Err(CubeError::Config(_))
        ));
    }
}
