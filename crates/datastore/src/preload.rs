//! Preload coordination: staging remote data ahead of the open stage.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use cube_common::{CubeError, CubeResult};

use crate::{DataStore, PreloadStatus};

/// Retry budget and staging behavior for one run.
#[derive(Debug, Clone)]
pub struct PreloadPolicy {
    /// Additional readiness polls after the first (so `max_retries + 1`
    /// polls total).
    pub max_retries: u32,
    /// Delay between readiness polls.
    pub retry_delay: Duration,
    /// Re-stage data ids that the store already has.
    pub force: bool,
}

impl Default for PreloadPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            force: false,
        }
    }
}

/// Tracks which data ids were submitted for staging during this run and
/// which failed at submission, keyed by `(store, data_id)`.
#[derive(Default)]
pub struct PreloadCoordinator {
    policy: PreloadPolicy,
    requested: RwLock<HashSet<(String, String)>>,
    submit_failures: RwLock<HashMap<(String, String), String>>,
}

impl PreloadCoordinator {
    pub fn new(policy: PreloadPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// Submit data ids for staging in `store`. Ids the store already has
    /// are skipped unless the policy forces re-staging. A submission
    /// error marks all submitted ids failed; later `wait_ready` calls for
    /// them report the error.
    pub async fn submit(&self, store: &Arc<dyn DataStore>, data_ids: &[String]) -> CubeResult<()> {
        if !store.supports_preload() {
            return Err(CubeError::Preload {
                store: store.name().to_string(),
                data_id: data_ids.first().cloned().unwrap_or_default(),
                message: "store does not support preloading".to_string(),
            });
        }

        let mut to_stage = Vec::new();
        for data_id in data_ids {
            if !self.policy.force && store.has_data(data_id).await {
                info!(store = %store.name(), data_id = %data_id, "already staged, skipping preload");
                continue;
            }
            to_stage.push(data_id.clone());
        }
        if to_stage.is_empty() {
            return Ok(());
        }

        debug!(store = %store.name(), count = to_stage.len(), "submitting preload");
        let keys: Vec<(String, String)> = to_stage
            .iter()
            .map(|id| (store.name().to_string(), id.clone()))
            .collect();
        match store.preload(&to_stage, self.policy.force).await {
            Ok(()) => {
                let mut requested = self.requested.write().expect("preload lock");
                requested.extend(keys);
                Ok(())
            }
            Err(e) => {
                warn!(store = %store.name(), error = %e, "preload submission failed");
                let mut failures = self.submit_failures.write().expect("preload lock");
                let message = e.to_string();
                for key in keys {
                    failures.insert(key, message.clone());
                }
                Err(e)
            }
        }
    }

    /// Whether `data_id` was submitted for staging in `store` this run.
    pub fn is_requested(&self, store: &str, data_id: &str) -> bool {
        let key = (store.to_string(), data_id.to_string());
        self.requested.read().expect("preload lock").contains(&key)
            || self
                .submit_failures
                .read()
                .expect("preload lock")
                .contains_key(&key)
    }

    /// Poll the store until `data_id` is staged, within the policy's
    /// retry budget. Ready within `max_retries + 1` polls succeeds; a
    /// `Failed` report or an exhausted budget is an error.
    pub async fn wait_ready(&self, store: &Arc<dyn DataStore>, data_id: &str) -> CubeResult<()> {
        let key = (store.name().to_string(), data_id.to_string());
        if let Some(message) = self
            .submit_failures
            .read()
            .expect("preload lock")
            .get(&key)
        {
            return Err(CubeError::Preload {
                store: store.name().to_string(),
                data_id: data_id.to_string(),
                message: message.clone(),
            });
        }

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
            match store.preload_status(data_id).await {
                PreloadStatus::Ready => {
                    debug!(store = %store.name(), data_id = %data_id, "preload ready");
                    return Ok(());
                }
                PreloadStatus::Pending => {
                    debug!(
                        store = %store.name(),
                        data_id = %data_id,
                        attempt = attempt + 1,
                        "preload pending"
                    );
                }
                PreloadStatus::Failed(message) => {
                    return Err(CubeError::Preload {
                        store: store.name().to_string(),
                        data_id: data_id.to_string(),
                        message,
                    })
                }
                PreloadStatus::NotRequested => {
                    return Err(CubeError::Preload {
                        store: store.name().to_string(),
                        data_id: data_id.to_string(),
                        message: "data id was never submitted for preload".to_string(),
                    })
                }
            }
        }
        Err(CubeError::Preload {
            store: store.name().to_string(),
            data_id: data_id.to_string(),
            message: format!(
                "not ready after {} readiness polls",
                self.policy.max_retries + 1
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn policy(max_retries: u32) -> PreloadPolicy {
        PreloadPolicy {
            max_retries,
            retry_delay: Duration::from_millis(1),
            force: false,
        }
    }

    fn remote_store(latency: u32) -> Arc<dyn DataStore> {
        let store = MemoryStore::new("mem").with_preload_latency(latency);
        store.insert_remote("r.nc", test_utils::sample_cube(3, 3, 0));
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_ready_within_budget() {
        let store = remote_store(2);
        let coordinator = PreloadCoordinator::new(policy(2));
        coordinator.submit(&store, &["r.nc".to_string()]).await.unwrap();
        assert!(coordinator.is_requested("mem", "r.nc"));
        coordinator.wait_ready(&store, "r.nc").await.unwrap();
    }

    #[tokio::test]
    async fn test_budget_exceeded() {
        let store = remote_store(5);
        let coordinator = PreloadCoordinator::new(policy(2));
        coordinator.submit(&store, &["r.nc".to_string()]).await.unwrap();
        let err = coordinator.wait_ready(&store, "r.nc").await.unwrap_err();
        assert!(matches!(err, CubeError::Preload { .. }));
    }

    #[tokio::test]
    async fn test_already_staged_filtering() {
        let store = MemoryStore::new("mem").with_preload_latency(3);
        store.insert("staged.nc", test_utils::sample_cube(3, 3, 0));
        let store: Arc<dyn DataStore> = Arc::new(store);

        let coordinator = PreloadCoordinator::new(policy(0));
        coordinator
            .submit(&store, &["staged.nc".to_string()])
            .await
            .unwrap();
        // filtered at submission, so nothing was requested
        assert!(!coordinator.is_requested("mem", "staged.nc"));
    }

    #[tokio::test]
    async fn test_failed_preload_reported() {
        let store = MemoryStore::new("mem").with_failing_preload("bad.nc");
        store.insert_remote("bad.nc", test_utils::sample_cube(3, 3, 0));
        let store: Arc<dyn DataStore> = Arc::new(store);

        let coordinator = PreloadCoordinator::new(policy(3));
        coordinator.submit(&store, &["bad.nc".to_string()]).await.unwrap();
        let err = coordinator.wait_ready(&store, "bad.nc").await.unwrap_err();
        assert!(err.to_string().contains("scripted preload failure"));
    }

    #[tokio::test]
    async fn test_submission_error_marks_ids_failed() {
        let store = MemoryStore::new("mem");
        let store: Arc<dyn DataStore> = Arc::new(store);

        let coordinator = PreloadCoordinator::new(policy(0));
        // unknown remote id: submission fails
        assert!(coordinator
            .submit(&store, &["missing.nc".to_string()])
            .await
            .is_err());
        assert!(coordinator.is_requested("mem", "missing.nc"));
        let err = coordinator.wait_ready(&store, "missing.nc").await.unwrap_err();
        assert!(matches!(err, CubeError::Preload { .. }));
    }
}
