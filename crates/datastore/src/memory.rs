//! In-memory store, used by tests and fixture-driven configurations.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use cube_common::{CubeError, CubeResult, DataCube, EvalContext};

use crate::{apply_open_params, DataStore, OpenParams, PreloadStatus};

#[derive(Debug)]
struct PreloadEntry {
    polls_remaining: u32,
    failed: bool,
}

/// Store backed by a `HashMap`.
///
/// Two pools of data are kept: `data` is openable immediately, `remote`
/// becomes openable only once preloaded. The preload script (a fixed
/// number of pending polls per id, plus ids that always fail) lets tests
/// drive the coordinator through every staging state.
#[derive(Debug, Default)]
pub struct MemoryStore {
    name: String,
    data: RwLock<HashMap<String, DataCube>>,
    remote: RwLock<HashMap<String, DataCube>>,
    staged: RwLock<HashSet<String>>,
    preloads: RwLock<HashMap<String, PreloadEntry>>,
    polls_until_ready: u32,
    fail_ids: HashSet<String>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Number of `Pending` polls each preload reports before `Ready`.
    pub fn with_preload_latency(mut self, polls: u32) -> Self {
        self.polls_until_ready = polls;
        self
    }

    /// Ids whose preload always reports `Failed`.
    pub fn with_failing_preload(mut self, data_id: impl Into<String>) -> Self {
        self.fail_ids.insert(data_id.into());
        self
    }

    /// Insert a dataset that can be opened without preloading.
    pub fn insert(&self, data_id: impl Into<String>, cube: DataCube) {
        self.data
            .write()
            .expect("memory store lock")
            .insert(data_id.into(), cube);
    }

    /// Insert a dataset that must be preloaded before it can be opened.
    pub fn insert_remote(&self, data_id: impl Into<String>, cube: DataCube) {
        self.remote
            .write()
            .expect("memory store lock")
            .insert(data_id.into(), cube);
    }

    fn is_staged(&self, data_id: &str) -> bool {
        self.staged.read().expect("memory store lock").contains(data_id)
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_data(&self, data_id: &str, params: &OpenParams) -> CubeResult<DataCube> {
        let cube = {
            let data = self.data.read().expect("memory store lock");
            if let Some(cube) = data.get(data_id) {
                cube.clone()
            } else {
                let remote = self.remote.read().expect("memory store lock");
                match remote.get(data_id) {
                    Some(cube) if self.is_staged(data_id) => cube.clone(),
                    Some(_) => {
                        return Err(CubeError::SourceAccess {
                            store: self.name.clone(),
                            data_id: data_id.to_string(),
                            message: "data requires preloading".to_string(),
                        })
                    }
                    None => {
                        return Err(CubeError::SourceAccess {
                            store: self.name.clone(),
                            data_id: data_id.to_string(),
                            message: "no such data id".to_string(),
                        })
                    }
                }
            }
        };
        apply_open_params(cube, params)
    }

    async fn write_data(
        &self,
        cube: &DataCube,
        data_id: &str,
        ctx: &EvalContext,
    ) -> CubeResult<()> {
        let materialized = cube.materialize(ctx)?;
        self.data
            .write()
            .expect("memory store lock")
            .insert(data_id.to_string(), materialized);
        Ok(())
    }

    async fn delete_data(&self, data_id: &str) -> CubeResult<()> {
        self.data.write().expect("memory store lock").remove(data_id);
        Ok(())
    }

    async fn has_data(&self, data_id: &str) -> bool {
        self.data.read().expect("memory store lock").contains_key(data_id)
            || self.is_staged(data_id)
    }

    fn supports_preload(&self) -> bool {
        true
    }

    async fn preload(&self, data_ids: &[String], force: bool) -> CubeResult<()> {
        let mut preloads = self.preloads.write().expect("memory store lock");
        for data_id in data_ids {
            if !force && self.is_staged(data_id) {
                debug!(store = %self.name, data_id = %data_id, "already preloaded, skipping");
                continue;
            }
            if !self
                .remote
                .read()
                .expect("memory store lock")
                .contains_key(data_id)
            {
                return Err(CubeError::Preload {
                    store: self.name.clone(),
                    data_id: data_id.clone(),
                    message: "no such data id".to_string(),
                });
            }
            preloads.insert(
                data_id.clone(),
                PreloadEntry {
                    polls_remaining: self.polls_until_ready,
                    failed: self.fail_ids.contains(data_id),
                },
            );
        }
        Ok(())
    }

    async fn preload_status(&self, data_id: &str) -> PreloadStatus {
        if self.is_staged(data_id) {
            return PreloadStatus::Ready;
        }
        let mut preloads = self.preloads.write().expect("memory store lock");
        match preloads.get_mut(data_id) {
            None => PreloadStatus::NotRequested,
            Some(entry) if entry.failed => {
                PreloadStatus::Failed("scripted preload failure".to_string())
            }
            Some(entry) => {
                if entry.polls_remaining == 0 {
                    self.staged
                        .write()
                        .expect("memory store lock")
                        .insert(data_id.to_string());
                    PreloadStatus::Ready
                } else {
                    entry.polls_remaining -= 1;
                    PreloadStatus::Pending
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_and_write() {
        let store = MemoryStore::new("mem");
        store.insert("a", test_utils::sample_cube(4, 4, 1));

        let cube = store.open_data("a", &OpenParams::new()).await.unwrap();
        assert_eq!(cube.dim_len("x"), Some(4));

        store
            .write_data(&cube, "b", &EvalContext::sequential())
            .await
            .unwrap();
        assert!(store.has_data("b").await);

        store.delete_data("b").await.unwrap();
        assert!(!store.has_data("b").await);
    }

    #[tokio::test]
    async fn test_remote_requires_preload() {
        let store = MemoryStore::new("mem").with_preload_latency(1);
        store.insert_remote("r", test_utils::sample_cube(4, 4, 0));

        assert!(store.open_data("r", &OpenParams::new()).await.is_err());
        assert!(!store.has_data("r").await);

        store.preload(&["r".to_string()], false).await.unwrap();
        assert_eq!(store.preload_status("r").await, PreloadStatus::Pending);
        assert_eq!(store.preload_status("r").await, PreloadStatus::Ready);
        assert!(store.open_data("r", &OpenParams::new()).await.is_ok());
        assert!(store.has_data("r").await);
    }

    #[tokio::test]
    async fn test_scripted_preload_failure() {
        let store = MemoryStore::new("mem").with_failing_preload("bad");
        store.insert_remote("bad", test_utils::sample_cube(4, 4, 0));

        store.preload(&["bad".to_string()], false).await.unwrap();
        assert!(matches!(
            store.preload_status("bad").await,
            PreloadStatus::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_unknown_id_errors() {
        let store = MemoryStore::new("mem");
        assert!(store.open_data("nope", &OpenParams::new()).await.is_err());
        assert!(store.preload(&["nope".to_string()], false).await.is_err());
    }
}
