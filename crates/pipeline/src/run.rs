//! Run-scoped execution context derived from the general configuration.

use std::time::Duration;

use cube_common::{CubeError, CubeResult, EvalContext};
use datastore::PreloadPolicy;

use crate::config::{GeneralConfig, SchedulerMode};

/// Evaluation and preload settings shared by every dataset in a run.
///
/// Deferred arrays are only materialized through the contained
/// [`EvalContext`]; nothing in the pipeline consults process-global
/// scheduler state.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub eval: EvalContext,
    pub preload: PreloadPolicy,
}

impl RunContext {
    pub fn from_general(general: &GeneralConfig) -> CubeResult<Self> {
        let eval = match general.scheduler {
            SchedulerMode::Threads => EvalContext::threads(general.num_threads)?,
            SchedulerMode::SingleThreaded | SchedulerMode::Sync => EvalContext::sequential(),
            SchedulerMode::Processes | SchedulerMode::Distributed => {
                return Err(CubeError::Config(format!(
                    "scheduler mode {:?} is not supported",
                    general.scheduler
                )));
            }
        };
        Ok(Self {
            eval,
            preload: PreloadPolicy {
                max_retries: general.preload_max_retries,
                retry_delay: Duration::from_millis(general.preload_retry_delay_ms),
                force: general.force_preload,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threads_scheduler() {
        let general = GeneralConfig {
            num_threads: 2,
            ..GeneralConfig::default()
        };
        let ctx = RunContext::from_general(&general).unwrap();
        assert!(ctx.eval.is_parallel());
        assert_eq!(ctx.preload.max_retries, 3);
    }

    #[test]
    fn test_sync_scheduler_is_sequential() {
        let general = GeneralConfig {
            scheduler: SchedulerMode::Sync,
            ..GeneralConfig::default()
        };
        let ctx = RunContext::from_general(&general).unwrap();
        assert!(!ctx.eval.is_parallel());
    }

    #[test]
    fn test_processes_scheduler_rejected() {
        let general = GeneralConfig {
            scheduler: SchedulerMode::Processes,
            ..GeneralConfig::default()
        };
        assert!(RunContext::from_general(&general).is_err());
    }
}
