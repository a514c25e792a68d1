//! Store construction and run-scoped handle caching.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use cube_common::{CubeError, CubeResult};

use crate::{DataStore, HttpStore, LocalStore, MemoryStore};

/// Parameters of a local filesystem store.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalParams {
    pub root: PathBuf,
}

/// Parameters of a remote HTTP store. Retry knobs left unset fall back
/// to the run-level retry configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpParams {
    pub base_url: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
}

/// Validated parameters of one configured store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreParams {
    Memory,
    Local(LocalParams),
    Http(HttpParams),
}

impl StoreParams {
    /// Interpret a `store_id` plus its free-form `store_params` block.
    pub fn from_config(store_id: &str, params: &serde_json::Value) -> CubeResult<Self> {
        let invalid = |e: serde_json::Error| {
            CubeError::Config(format!("invalid store_params for '{store_id}': {e}"))
        };
        match store_id {
            "memory" => Ok(StoreParams::Memory),
            "file" => Ok(StoreParams::Local(
                serde_json::from_value(params.clone()).map_err(invalid)?,
            )),
            "https" => Ok(StoreParams::Http(
                serde_json::from_value(params.clone()).map_err(invalid)?,
            )),
            other => Err(CubeError::Config(format!("unknown store_id '{other}'"))),
        }
    }
}

/// Construct a store from its validated parameters.
pub fn new_data_store(identifier: &str, params: &StoreParams) -> Arc<dyn DataStore> {
    match params {
        StoreParams::Memory => Arc::new(MemoryStore::new(identifier)),
        StoreParams::Local(p) => Arc::new(LocalStore::new(identifier, &p.root)),
        StoreParams::Http(p) => Arc::new(HttpStore::new(
            identifier,
            &p.base_url,
            p.max_retries.unwrap_or(3),
            Duration::from_millis(p.retry_delay_ms.unwrap_or(1000)),
        )),
    }
}

/// Run-scoped store registry.
///
/// Each configured store identifier is constructed at most once per run;
/// later lookups return the cached handle so connection state and staged
/// data are shared across datasets.
pub struct StoreRegistry {
    specs: HashMap<String, StoreParams>,
    handles: Mutex<HashMap<String, Arc<dyn DataStore>>>,
}

impl StoreRegistry {
    pub fn new(specs: HashMap<String, StoreParams>) -> Self {
        Self {
            specs,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `identifier` is configured.
    pub fn contains(&self, identifier: &str) -> bool {
        self.specs.contains_key(identifier)
    }

    /// Fetch (or construct and cache) the handle for `identifier`.
    pub fn get(&self, identifier: &str) -> CubeResult<Arc<dyn DataStore>> {
        let mut handles = self.handles.lock().expect("store registry lock");
        if let Some(handle) = handles.get(identifier) {
            return Ok(Arc::clone(handle));
        }
        let params = self.specs.get(identifier).ok_or_else(|| {
            CubeError::Config(format!("no configured store named '{identifier}'"))
        })?;
        debug!(store = %identifier, "constructing store handle");
        let handle = new_data_store(identifier, params);
        handles.insert(identifier.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Install a pre-built handle, replacing any configured construction.
    /// Used by tests to seed in-memory stores with fixture data.
    pub fn insert_handle(&self, identifier: impl Into<String>, handle: Arc<dyn DataStore>) {
        self.handles
            .lock()
            .expect("store registry lock")
            .insert(identifier.into(), handle);
    }
}
