//! Local filesystem store holding Zarr directories and NetCDF files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use cube_common::{CubeError, CubeResult, DataCube, EvalContext};

use crate::{apply_open_params, netcdf_io, zarr_io, DataStore, OpenParams};

/// Store rooted at a directory; the data id is the file name, and its
/// extension (`.zarr` / `.nc`) selects the format.
pub struct LocalStore {
    name: String,
    root: PathBuf,
}

enum Format {
    Zarr,
    NetCdf,
}

impl LocalStore {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, data_id: &str) -> CubeResult<(PathBuf, Format)> {
        if data_id.contains("..") || data_id.contains('/') {
            return Err(CubeError::SourceAccess {
                store: self.name.clone(),
                data_id: data_id.to_string(),
                message: "data id must be a plain file name".to_string(),
            });
        }
        let format = if data_id.ends_with(".zarr") {
            Format::Zarr
        } else if data_id.ends_with(".nc") {
            Format::NetCdf
        } else {
            return Err(CubeError::SourceAccess {
                store: self.name.clone(),
                data_id: data_id.to_string(),
                message: "unsupported extension (expected .zarr or .nc)".to_string(),
            });
        };
        Ok((self.root.join(data_id), format))
    }
}

#[async_trait]
impl DataStore for LocalStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_data(&self, data_id: &str, params: &OpenParams) -> CubeResult<DataCube> {
        let (path, format) = self.resolve(data_id)?;
        if !path.exists() {
            return Err(CubeError::SourceAccess {
                store: self.name.clone(),
                data_id: data_id.to_string(),
                message: format!("{} does not exist", path.display()),
            });
        }
        debug!(store = %self.name, data_id = %data_id, "opening local dataset");
        let cube = match format {
            Format::Zarr => zarr_io::read_cube(&path, &self.name, data_id)?,
            Format::NetCdf => netcdf_io::read_cube(&path, &self.name, data_id)?,
        };
        apply_open_params(cube, params)
    }

    async fn write_data(
        &self,
        cube: &DataCube,
        data_id: &str,
        ctx: &EvalContext,
    ) -> CubeResult<()> {
        let (path, format) = self.resolve(data_id).map_err(|e| CubeError::Write {
            data_id: data_id.to_string(),
            message: e.to_string(),
        })?;
        std::fs::create_dir_all(&self.root).map_err(|e| CubeError::Write {
            data_id: data_id.to_string(),
            message: e.to_string(),
        })?;
        debug!(store = %self.name, data_id = %data_id, path = %path.display(), "writing dataset");
        match format {
            Format::Zarr => {
                std::fs::create_dir_all(&path).map_err(|e| CubeError::Write {
                    data_id: data_id.to_string(),
                    message: e.to_string(),
                })?;
                zarr_io::write_cube(&path, cube, data_id, ctx)
            }
            Format::NetCdf => netcdf_io::write_cube(&path, cube, data_id, ctx),
        }
    }

    async fn delete_data(&self, data_id: &str) -> CubeResult<()> {
        let (path, format) = self.resolve(data_id)?;
        if !path.exists() {
            return Ok(());
        }
        let result = match format {
            Format::Zarr => std::fs::remove_dir_all(&path),
            Format::NetCdf => std::fs::remove_file(&path),
        };
        result.map_err(|e| CubeError::Write {
            data_id: data_id.to_string(),
            message: format!("failed to delete: {e}"),
        })
    }

    async fn has_data(&self, data_id: &str) -> bool {
        self.resolve(data_id)
            .map(|(path, _)| path.exists())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_zarr_and_netcdf_agree() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new("storage", dir.path());
        let cube = test_utils::sample_cube(5, 4, 2)
            .cleaned()
            .with_attrs_flattened();
        let ctx = EvalContext::sequential();

        store.write_data(&cube, "sm.zarr", &ctx).await.unwrap();
        store.write_data(&cube, "sm.nc", &ctx).await.unwrap();
        assert!(store.has_data("sm.zarr").await);
        assert!(store.has_data("sm.nc").await);

        let params = OpenParams::new();
        let from_zarr = store.open_data("sm.zarr", &params).await.unwrap();
        let from_nc = store.open_data("sm.nc", &params).await.unwrap();

        assert_eq!(from_zarr.dims, from_nc.dims);
        let a = from_zarr.vars["sm"].array.values(&ctx).unwrap();
        let b = from_nc.vars["sm"].array.values(&ctx).unwrap();
        assert_eq!(a.as_ref(), b.as_ref());
    }

    #[tokio::test]
    async fn test_delete_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new("storage", dir.path());
        let cube = test_utils::sample_cube(3, 3, 0);
        let ctx = EvalContext::sequential();

        store.write_data(&cube, "a.zarr", &ctx).await.unwrap();
        store.delete_data("a.zarr").await.unwrap();
        assert!(!store.has_data("a.zarr").await);
        // deleting missing data is not an error
        store.delete_data("a.zarr").await.unwrap();
    }

    #[tokio::test]
    async fn test_open_honors_bbox_param() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new("storage", dir.path());
        let cube = test_utils::sample_cube(10, 10, 0);
        let ctx = EvalContext::sequential();
        store.write_data(&cube, "big.zarr", &ctx).await.unwrap();

        let mut params = OpenParams::new();
        params.insert("bbox".to_string(), json!([2.0, 42.0, 6.0, 46.0]));
        let clipped = store.open_data("big.zarr", &params).await.unwrap();
        assert_eq!(clipped.dim_len("x"), Some(4));
    }

    #[tokio::test]
    async fn test_rejects_bad_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new("storage", dir.path());
        assert!(store.open_data("../etc.zarr", &OpenParams::new()).await.is_err());
        assert!(store.open_data("plain.txt", &OpenParams::new()).await.is_err());
    }
}
