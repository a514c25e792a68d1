//! Resolution of grid mapping references.
//!
//! A dataset's `grid_mapping` names either an explicitly configured grid
//! or another dataset, in which case the grid is derived from that
//! dataset's already generated output in the output store. Configured
//! grids win when both exist under the same name.

use std::collections::HashMap;

use tracing::debug;

use cube_common::{CubeError, CubeResult, GridMapping};
use datastore::{OpenParams, StoreRegistry};

use crate::config::{Config, OUTPUT_STORE};

pub struct GridMappingResolver {
    configured: HashMap<String, GridMapping>,
}

impl GridMappingResolver {
    pub fn from_config(config: &Config) -> CubeResult<Self> {
        Ok(Self {
            configured: config.grid_mappings()?,
        })
    }

    /// Resolve `reference` to a concrete grid mapping.
    ///
    /// Dataset-derived grids require the referenced dataset to have been
    /// generated earlier in the run (or a previous run); configuration
    /// order determines whether that holds.
    pub async fn resolve(
        &self,
        reference: &str,
        config: &Config,
        stores: &StoreRegistry,
    ) -> CubeResult<GridMapping> {
        if let Some(grid) = self.configured.get(reference) {
            return Ok(*grid);
        }
        let dataset = config.dataset(reference).ok_or_else(|| {
            CubeError::Config(format!("unknown grid mapping reference '{reference}'"))
        })?;
        let data_id = dataset.output_data_id();
        debug!(dataset = %reference, data_id = %data_id, "deriving grid mapping from generated output");
        let storage = stores.get(OUTPUT_STORE)?;
        let cube = storage
            .open_data(&data_id, &OpenParams::new())
            .await
            .map_err(|e| {
                CubeError::Harmonize(format!(
                    "cannot derive grid mapping from dataset '{reference}': {e}"
                ))
            })?;
        GridMapping::from_cube(&cube)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    use datastore::MemoryStore;

    use super::*;
    use crate::transforms::TransformRegistry;

    fn config_with_grid() -> Config {
        let config = Config::from_yaml_str(
            r#"
datasets:
  - identifier: sm
    store: storage
    data_id: raw_sm.zarr
    grid_mapping: europe
  - identifier: lst
    store: storage
    data_id: raw_lst.zarr
    grid_mapping: sm
data_stores:
  - identifier: storage
    store_id: memory
grid_mappings:
  - identifier: europe
    bbox: [0, 40, 10, 50]
    spatial_res: 1.0
"#,
        )
        .unwrap();
        config.validate(&TransformRegistry::with_builtins()).unwrap();
        config
    }

    #[tokio::test]
    async fn test_configured_grid_wins() {
        let config = config_with_grid();
        let stores = StoreRegistry::new(StdHashMap::new());
        let resolver = GridMappingResolver::from_config(&config).unwrap();
        let grid = resolver.resolve("europe", &config, &stores).await.unwrap();
        assert_eq!(grid.width(), 10);
        assert_eq!(grid.height(), 10);
    }

    #[tokio::test]
    async fn test_dataset_reference_reads_generated_output() {
        let config = config_with_grid();
        let storage = Arc::new(MemoryStore::new(OUTPUT_STORE));
        storage.insert("sm.zarr", test_utils::sample_cube(8, 6, 1));
        let stores = StoreRegistry::new(StdHashMap::new());
        stores.insert_handle(OUTPUT_STORE, storage);

        let resolver = GridMappingResolver::from_config(&config).unwrap();
        let grid = resolver.resolve("sm", &config, &stores).await.unwrap();
        assert_eq!(grid.width(), 8);
        assert_eq!(grid.height(), 6);
        assert!((grid.spatial_res - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_output_is_harmonize_error() {
        let config = config_with_grid();
        let stores = StoreRegistry::new(StdHashMap::new());
        stores.insert_handle(OUTPUT_STORE, Arc::new(MemoryStore::new(OUTPUT_STORE)));

        let resolver = GridMappingResolver::from_config(&config).unwrap();
        let err = resolver.resolve("sm", &config, &stores).await.unwrap_err();
        assert!(matches!(err, CubeError::Harmonize(_)));
    }
}
