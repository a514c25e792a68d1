//! YAML configuration model and load-time validation.
//!
//! Unknown keys anywhere in the file are configuration errors, as are
//! dangling references (stores, grid mappings, transform names). A valid
//! configuration is required before any dataset is touched; everything
//! that can fail fast does fail fast here.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use cube_common::{BoundingBox, Crs, CubeError, CubeResult, GridMapping, DEFAULT_TILE_SIZE};
use datastore::registry::StoreParams;
use datastore::OpenParams;
use harmonize::point::PointParams;
use harmonize::ResampleMethod;

use crate::transforms::TransformRegistry;

/// Identifier of the designated output store.
pub const OUTPUT_STORE: &str = "storage";

fn default_fill_value() -> f32 {
    f32::NAN
}

fn default_crs() -> String {
    "EPSG:4326".to_string()
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub datasets: Vec<DatasetSpec>,
    #[serde(default)]
    pub preload_datasets: Vec<PreloadSpec>,
    pub data_stores: Vec<StoreSpec>,
    #[serde(default)]
    pub grid_mappings: Vec<GridMappingSpec>,
    #[serde(default)]
    pub general: GeneralConfig,
}

/// One dataset entry: either single-source (`store` + `data_id`) or
/// multi-source (`variables`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetSpec {
    pub identifier: String,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub data_id: Option<String>,
    /// Name of a configured grid mapping, or of another dataset whose
    /// generated output defines the target grid.
    #[serde(default)]
    pub grid_mapping: Option<String>,
    #[serde(default)]
    pub open_params: OpenParams,
    #[serde(default)]
    pub format_id: FormatId,
    #[serde(default)]
    pub resampling: ResampleMethod,
    #[serde(default = "default_fill_value")]
    pub fill_value: f32,
    #[serde(default)]
    pub custom_processing: Option<CustomProcessing>,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub merge_params: MergeParams,
}

/// One variable of a multi-source dataset; structurally a single-source
/// spec scoped to one output variable name.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableSpec {
    pub identifier: String,
    pub store: String,
    pub data_id: String,
    #[serde(default)]
    pub open_params: OpenParams,
    #[serde(default)]
    pub custom_processing: Option<CustomProcessing>,
}

/// A named transform applied to a freshly opened dataset.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomProcessing {
    pub function_name: String,
}

/// Uniform view over the sources of a dataset entry.
#[derive(Debug, Clone, Copy)]
pub struct SourceRef<'a> {
    pub identifier: &'a str,
    pub store: &'a str,
    pub data_id: &'a str,
    pub open_params: &'a OpenParams,
    pub custom_processing: Option<&'a CustomProcessing>,
}

/// Output serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatId {
    #[default]
    Zarr,
    Netcdf,
}

impl FormatId {
    pub fn extension(&self) -> &'static str {
        match self {
            FormatId::Zarr => "zarr",
            FormatId::Netcdf => "nc",
        }
    }
}

/// Merge policy for multi-source datasets. Only the exact join with
/// conflict-dropping attribute union is supported; other values fail at
/// configuration load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeParams {
    #[serde(default)]
    pub join: JoinPolicy,
    #[serde(default)]
    pub combine_attrs: CombineAttrsPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    #[default]
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineAttrsPolicy {
    #[default]
    DropConflicts,
}

/// A preload request: data ids to stage in one store before generation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreloadSpec {
    pub store: String,
    pub data_ids: Vec<String>,
}

/// One configured store.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSpec {
    pub identifier: String,
    pub store_id: String,
    #[serde(default)]
    pub store_params: Value,
}

/// An explicitly configured target grid.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridMappingSpec {
    pub identifier: String,
    #[serde(default = "default_crs")]
    pub crs: String,
    /// `[west, south, east, north]` in CRS units.
    pub bbox: [f64; 4],
    pub spatial_res: f64,
    #[serde(default)]
    pub tile_size: Option<TileSize>,
}

/// Tile size: a single edge length (square tiles) or `[width, height]`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum TileSize {
    Square(usize),
    Rect([usize; 2]),
}

impl GridMappingSpec {
    pub fn to_grid_mapping(&self) -> CubeResult<GridMapping> {
        let crs = Crs::from_user_input(&self.crs)?;
        let tile_size = match self.tile_size {
            None => (DEFAULT_TILE_SIZE, DEFAULT_TILE_SIZE),
            Some(TileSize::Square(edge)) => (edge, edge),
            Some(TileSize::Rect([w, h])) => (w, h),
        };
        GridMapping::new(crs, BoundingBox::from_array(self.bbox), self.spatial_res, tile_size)
            .map_err(|e| {
                CubeError::Config(format!("grid mapping '{}': {e}", self.identifier))
            })
    }
}

/// Lazy-array scheduler selection. `processes` and `distributed` are
/// recognized but rejected at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerMode {
    #[default]
    Threads,
    SingleThreaded,
    Sync,
    Processes,
    Distributed,
}

/// Run-level knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GeneralConfig {
    pub visualize: bool,
    pub force_preload: bool,
    pub force_regenerate: bool,
    pub scheduler: SchedulerMode,
    /// Worker count for the `threads` scheduler; zero means one per CPU.
    pub num_threads: usize,
    pub preload_max_retries: u32,
    pub preload_retry_delay_ms: u64,
    /// Defaults for HTTP stores that do not set their own retry knobs.
    pub http_max_retries: u32,
    pub http_retry_delay_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            visualize: false,
            force_preload: false,
            force_regenerate: false,
            scheduler: SchedulerMode::default(),
            num_threads: 0,
            preload_max_retries: 3,
            preload_retry_delay_ms: 1000,
            http_max_retries: 3,
            http_retry_delay_ms: 1000,
        }
    }
}

impl DatasetSpec {
    pub fn is_multi(&self) -> bool {
        !self.variables.is_empty()
    }

    /// Data id of the generated output in the output store.
    pub fn output_data_id(&self) -> String {
        format!("{}.{}", self.identifier, self.format_id.extension())
    }

    /// The dataset's sources in configuration order.
    pub fn sources(&self) -> Vec<SourceRef<'_>> {
        if self.is_multi() {
            self.variables
                .iter()
                .map(|v| SourceRef {
                    identifier: &v.identifier,
                    store: &v.store,
                    data_id: &v.data_id,
                    open_params: &v.open_params,
                    custom_processing: v.custom_processing.as_ref(),
                })
                .collect()
        } else {
            vec![SourceRef {
                identifier: &self.identifier,
                store: self.store.as_deref().unwrap_or_default(),
                data_id: self.data_id.as_deref().unwrap_or_default(),
                open_params: &self.open_params,
                custom_processing: self.custom_processing.as_ref(),
            }]
        }
    }
}

/// Parse the `point` / `neighborhood` open parameters, if present.
pub fn point_params(open_params: &OpenParams) -> CubeResult<Option<PointParams>> {
    let Some(value) = open_params.get("point") else {
        return Ok(None);
    };
    let [lat, lon]: [f64; 2] = serde_json::from_value(value.clone())
        .map_err(|e| CubeError::Config(format!("invalid point parameter: {e}")))?;
    let neighborhood = match open_params.get("neighborhood") {
        None => 0.0,
        Some(v) => serde_json::from_value::<f64>(v.clone())
            .map_err(|e| CubeError::Config(format!("invalid neighborhood parameter: {e}")))?,
    };
    if neighborhood < 0.0 {
        return Err(CubeError::Config(format!(
            "neighborhood must not be negative, got {neighborhood}"
        )));
    }
    Ok(Some(PointParams {
        lat,
        lon,
        neighborhood,
    }))
}

/// Open parameters actually forwarded to the store: control keys are
/// stripped, and a point request with a known `spatial_res` is widened
/// to a bbox of two cells around the point so interpolation has support.
pub fn store_open_params(open_params: &OpenParams) -> CubeResult<OpenParams> {
    let mut out = open_params.clone();
    out.remove("neighborhood");
    let point = point_params(open_params)?;
    out.remove("point");
    let spatial_res = match out.remove("spatial_res") {
        None => None,
        Some(v) => Some(
            serde_json::from_value::<f64>(v)
                .map_err(|e| CubeError::Config(format!("invalid spatial_res parameter: {e}")))?,
        ),
    };
    if let (Some(p), Some(res), None) = (point, spatial_res, out.get("bbox")) {
        out.insert(
            "bbox".to_string(),
            serde_json::json!([
                p.lon - 2.0 * res,
                p.lat - 2.0 * res,
                p.lon + 2.0 * res,
                p.lat + 2.0 * res,
            ]),
        );
    }
    Ok(out)
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> CubeResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| CubeError::Config(e.to_string()))
    }

    pub fn from_path(path: &Path) -> CubeResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CubeError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn dataset(&self, identifier: &str) -> Option<&DatasetSpec> {
        self.datasets.iter().find(|d| d.identifier == identifier)
    }

    /// Validated store parameters keyed by store identifier, with
    /// run-level HTTP retry defaults applied.
    pub fn store_params(&self) -> CubeResult<HashMap<String, StoreParams>> {
        let mut out = HashMap::new();
        for spec in &self.data_stores {
            let mut params = StoreParams::from_config(&spec.store_id, &spec.store_params)?;
            if let StoreParams::Http(http) = &mut params {
                http.max_retries.get_or_insert(self.general.http_max_retries);
                http.retry_delay_ms
                    .get_or_insert(self.general.http_retry_delay_ms);
            }
            out.insert(spec.identifier.clone(), params);
        }
        Ok(out)
    }

    /// Configured grid mappings keyed by identifier.
    pub fn grid_mappings(&self) -> CubeResult<HashMap<String, GridMapping>> {
        self.grid_mappings
            .iter()
            .map(|spec| Ok((spec.identifier.clone(), spec.to_grid_mapping()?)))
            .collect()
    }

    /// Full structural validation. Must pass before any dataset is
    /// processed; every failure here is a [`CubeError::Config`].
    pub fn validate(&self, transforms: &TransformRegistry) -> CubeResult<()> {
        if self.datasets.is_empty() {
            return Err(CubeError::Config("no datasets configured".to_string()));
        }

        let mut store_ids = HashSet::new();
        for store in &self.data_stores {
            if !store_ids.insert(store.identifier.as_str()) {
                return Err(CubeError::Config(format!(
                    "duplicate store identifier '{}'",
                    store.identifier
                )));
            }
        }
        if !store_ids.contains(OUTPUT_STORE) {
            return Err(CubeError::Config(format!(
                "a store with identifier '{OUTPUT_STORE}' is required for writing"
            )));
        }
        self.store_params()?;

        let mut grid_ids = HashSet::new();
        for spec in &self.grid_mappings {
            if !grid_ids.insert(spec.identifier.as_str()) {
                return Err(CubeError::Config(format!(
                    "duplicate grid mapping identifier '{}'",
                    spec.identifier
                )));
            }
            spec.to_grid_mapping()?;
        }

        let mut dataset_ids = HashSet::new();
        for dataset in &self.datasets {
            if !dataset_ids.insert(dataset.identifier.as_str()) {
                return Err(CubeError::Config(format!(
                    "duplicate dataset identifier '{}'",
                    dataset.identifier
                )));
            }
        }

        for dataset in &self.datasets {
            self.validate_dataset(dataset, &store_ids, &grid_ids, transforms)?;
        }

        for preload in &self.preload_datasets {
            if !store_ids.contains(preload.store.as_str()) {
                return Err(CubeError::Config(format!(
                    "preload references unknown store '{}'",
                    preload.store
                )));
            }
            if preload.data_ids.is_empty() {
                return Err(CubeError::Config(format!(
                    "preload for store '{}' lists no data ids",
                    preload.store
                )));
            }
        }

        match self.general.scheduler {
            SchedulerMode::Processes | SchedulerMode::Distributed => {
                return Err(CubeError::Config(format!(
                    "scheduler mode {:?} is not supported; use threads, single-threaded, or sync",
                    self.general.scheduler
                )));
            }
            _ => {}
        }
        Ok(())
    }

    fn validate_dataset(
        &self,
        dataset: &DatasetSpec,
        store_ids: &HashSet<&str>,
        grid_ids: &HashSet<&str>,
        transforms: &TransformRegistry,
    ) -> CubeResult<()> {
        let id = &dataset.identifier;
        let single = dataset.store.is_some() || dataset.data_id.is_some();
        if single && dataset.is_multi() {
            return Err(CubeError::Config(format!(
                "dataset '{id}' mixes single-source fields with a variables list"
            )));
        }
        if !single && !dataset.is_multi() {
            return Err(CubeError::Config(format!(
                "dataset '{id}' needs either store+data_id or a variables list"
            )));
        }
        if single && (dataset.store.is_none() || dataset.data_id.is_none()) {
            return Err(CubeError::Config(format!(
                "dataset '{id}' needs both store and data_id"
            )));
        }
        if dataset.is_multi() {
            if dataset.grid_mapping.is_none() {
                return Err(CubeError::Config(format!(
                    "multi-source dataset '{id}' requires a grid_mapping"
                )));
            }
            if dataset.custom_processing.is_some() {
                return Err(CubeError::Config(format!(
                    "dataset '{id}': custom_processing belongs on the variables, \
                     not the multi-source entry"
                )));
            }
            let mut var_ids = HashSet::new();
            for var in &dataset.variables {
                if !var_ids.insert(var.identifier.as_str()) {
                    return Err(CubeError::Config(format!(
                        "dataset '{id}': duplicate variable identifier '{}'",
                        var.identifier
                    )));
                }
            }
        }

        if let Some(reference) = &dataset.grid_mapping {
            let names_dataset =
                reference != id && self.datasets.iter().any(|d| &d.identifier == reference);
            if !grid_ids.contains(reference.as_str()) && !names_dataset {
                return Err(CubeError::Config(format!(
                    "dataset '{id}' references unknown grid mapping '{reference}'"
                )));
            }
        }

        for source in dataset.sources() {
            if !store_ids.contains(source.store) {
                return Err(CubeError::Config(format!(
                    "dataset '{id}' references unknown store '{}'",
                    source.store
                )));
            }
            if let Some(processing) = source.custom_processing {
                if !transforms.contains(&processing.function_name) {
                    return Err(CubeError::Config(format!(
                        "dataset '{id}' references unknown processing function '{}'",
                        processing.function_name
                    )));
                }
            }
            point_params(source.open_params)?;
            store_open_params(source.open_params)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_yaml() -> &'static str {
        r#"
datasets:
  - identifier: sm
    store: cds
    data_id: sm.nc
data_stores:
  - identifier: cds
    store_id: memory
  - identifier: storage
    store_id: memory
"#
    }

    #[test]
    fn test_minimal_config_is_valid() {
        let config = Config::from_yaml_str(minimal_yaml()).unwrap();
        config.validate(&TransformRegistry::with_builtins()).unwrap();
        assert_eq!(config.datasets[0].output_data_id(), "sm.zarr");
        assert_eq!(config.general.scheduler, SchedulerMode::Threads);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let yaml = minimal_yaml().replace("data_id: sm.nc", "data_id: sm.nc\n    wat: 1");
        assert!(Config::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_missing_storage_store_rejected() {
        let yaml = r#"
datasets:
  - identifier: sm
    store: cds
    data_id: sm.nc
data_stores:
  - identifier: cds
    store_id: memory
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        let err = config
            .validate(&TransformRegistry::with_builtins())
            .unwrap_err();
        assert!(err.to_string().contains("storage"));
    }

    #[test]
    fn test_multi_source_requires_grid_mapping() {
        let yaml = r#"
datasets:
  - identifier: combined
    variables:
      - identifier: sm
        store: storage
        data_id: sm.nc
data_stores:
  - identifier: storage
    store_id: memory
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        let err = config
            .validate(&TransformRegistry::with_builtins())
            .unwrap_err();
        assert!(err.to_string().contains("grid_mapping"));
    }

    #[test]
    fn test_unknown_transform_rejected() {
        let yaml = r#"
datasets:
  - identifier: sm
    store: storage
    data_id: sm.nc
    custom_processing:
      function_name: does_not_exist
data_stores:
  - identifier: storage
    store_id: memory
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert!(config.validate(&TransformRegistry::with_builtins()).is_err());
    }

    #[test]
    fn test_unsupported_scheduler_rejected() {
        let yaml = format!("{}\ngeneral:\n  scheduler: processes\n", minimal_yaml());
        let config = Config::from_yaml_str(&yaml).unwrap();
        assert!(config.validate(&TransformRegistry::with_builtins()).is_err());
    }

    #[test]
    fn test_unsupported_merge_policy_fails_parse() {
        let yaml = r#"
datasets:
  - identifier: c
    grid_mapping: g
    merge_params:
      join: outer
    variables:
      - identifier: sm
        store: storage
        data_id: sm.nc
data_stores:
  - identifier: storage
    store_id: memory
grid_mappings:
  - identifier: g
    bbox: [0, 40, 10, 50]
    spatial_res: 0.5
"#;
        assert!(Config::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_grid_mapping_tile_size_forms() {
        let square = GridMappingSpec {
            identifier: "g".into(),
            crs: "EPSG:4326".into(),
            bbox: [0.0, 40.0, 10.0, 50.0],
            spatial_res: 0.5,
            tile_size: Some(TileSize::Square(512)),
        };
        assert_eq!(square.to_grid_mapping().unwrap().tile_size, (512, 512));

        let rect = GridMappingSpec {
            tile_size: Some(TileSize::Rect([256, 128])),
            ..square.clone()
        };
        assert_eq!(rect.to_grid_mapping().unwrap().tile_size, (256, 128));

        let default = GridMappingSpec {
            tile_size: None,
            ..square
        };
        assert_eq!(
            default.to_grid_mapping().unwrap().tile_size,
            (DEFAULT_TILE_SIZE, DEFAULT_TILE_SIZE)
        );
    }

    #[test]
    fn test_point_widening() {
        let mut open = OpenParams::new();
        open.insert("point".to_string(), json!([48.0, 11.0]));
        open.insert("spatial_res".to_string(), json!(0.25));

        let p = point_params(&open).unwrap().unwrap();
        assert_eq!(p.lat, 48.0);
        assert_eq!(p.lon, 11.0);
        assert_eq!(p.neighborhood, 0.0);

        let store_params = store_open_params(&open).unwrap();
        assert!(!store_params.contains_key("point"));
        assert!(!store_params.contains_key("spatial_res"));
        assert_eq!(store_params["bbox"], json!([10.5, 47.5, 11.5, 48.5]));
    }

    #[test]
    fn test_explicit_bbox_not_overwritten() {
        let mut open = OpenParams::new();
        open.insert("point".to_string(), json!([48.0, 11.0]));
        open.insert("spatial_res".to_string(), json!(0.25));
        open.insert("bbox".to_string(), json!([0.0, 0.0, 1.0, 1.0]));
        let store_params = store_open_params(&open).unwrap();
        assert_eq!(store_params["bbox"], json!([0.0, 0.0, 1.0, 1.0]));
    }
}
