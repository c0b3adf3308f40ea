//! Exit status for every typed failure.

use ubench_core::{ConfigError, RecipeError};
use ubench_monitor::MonitorError;
use ubench_scheduler::OrchestratorError;
use ubench_state::StateError;

pub const GENERIC: u8 = 1;
pub const VALIDATION: u8 = 2;
pub const SUBMISSION: u8 = 3;
pub const PLACEMENT_TIMEOUT: u8 = 4;
pub const PLACEMENT_FAILED: u8 = 5;
pub const DISCOVERY_MISS: u8 = 6;
pub const NO_TARGETS: u8 = 7;
pub const COLLECTOR_UNREACHABLE: u8 = 8;
pub const NO_SUCH_INSTANCE: u8 = 9;
pub const STORE: u8 = 10;
pub const INTERRUPTED: u8 = 130;

/// Flag combinations clap accepts but that make no sense together.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct UsageError(pub String);

/// Classify by the first typed error in the chain.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<OrchestratorError>() {
            return orchestrator_code(e);
        }
        if let Some(e) = cause.downcast_ref::<MonitorError>() {
            return monitor_code(e);
        }
        if cause.is::<RecipeError>() || cause.is::<ConfigError>() || cause.is::<UsageError>() {
            return VALIDATION;
        }
        if cause.is::<StateError>() {
            return STORE;
        }
    }
    GENERIC
}

fn orchestrator_code(e: &OrchestratorError) -> u8 {
    match e {
        OrchestratorError::Validation(_)
        | OrchestratorError::Recipe(_)
        | OrchestratorError::AmbiguousInstance(_) => VALIDATION,
        OrchestratorError::Submission { .. } => SUBMISSION,
        OrchestratorError::PlacementTimeout { .. } | OrchestratorError::NotYetPlaced { .. } => {
            PLACEMENT_TIMEOUT
        }
        OrchestratorError::PlacementFailed { .. } => PLACEMENT_FAILED,
        OrchestratorError::DiscoveryMiss { .. } => DISCOVERY_MISS,
        OrchestratorError::NoSuchInstance(_) => NO_SUCH_INSTANCE,
        OrchestratorError::Interrupted(_) => INTERRUPTED,
        OrchestratorError::Store(_) => STORE,
        OrchestratorError::Scheduler(_) | OrchestratorError::Io(_) => GENERIC,
    }
}

fn monitor_code(e: &MonitorError) -> u8 {
    match e {
        MonitorError::NoTargetsResolved { .. } => NO_TARGETS,
        MonitorError::CollectorUnreachable { .. } => COLLECTOR_UNREACHABLE,
        // A monitor that never placed has no collector to reach.
        MonitorError::NotRunning { .. } | MonitorError::NoSuchInstance(_) => NO_SUCH_INSTANCE,
        MonitorError::Invalid(_) | MonitorError::Recipe(_) => VALIDATION,
        MonitorError::Orchestrator(inner) => orchestrator_code(inner),
        MonitorError::Store(_) => STORE,
        MonitorError::Query { .. } | MonitorError::Serialize(_) | MonitorError::Io(_) => GENERIC,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use anyhow::Context as _;

    fn code(e: impl std::error::Error + Send + Sync + 'static) -> u8 {
        exit_code(&anyhow::Error::new(e))
    }

    #[test]
    fn orchestrator_outcomes_have_distinct_codes() {
        let codes = [
            code(OrchestratorError::Validation("x".into())),
            code(OrchestratorError::Submission {
                recipe: "r".into(),
                source: ubench_scheduler::SchedulerError::Unavailable("down".into()),
            }),
            code(OrchestratorError::PlacementTimeout {
                instance_id: "i".into(),
                handle: "1".into(),
                waited: Duration::from_secs(1),
            }),
            code(OrchestratorError::PlacementFailed {
                handle: "1".into(),
                reason: "NODE_FAIL".into(),
            }),
            code(OrchestratorError::DiscoveryMiss {
                service: "vllm".into(),
            }),
            code(OrchestratorError::NoSuchInstance("i".into())),
        ];
        assert_eq!(
            codes,
            [VALIDATION, SUBMISSION, PLACEMENT_TIMEOUT, PLACEMENT_FAILED, DISCOVERY_MISS, NO_SUCH_INSTANCE]
        );
    }

    #[test]
    fn monitor_outcomes() {
        assert_eq!(
            code(MonitorError::NoTargetsResolved {
                monitor: "m".into()
            }),
            NO_TARGETS
        );
        assert_eq!(
            code(MonitorError::CollectorUnreachable {
                url: "http://x:9090".into(),
                reason: "refused".into()
            }),
            COLLECTOR_UNREACHABLE
        );
        assert_eq!(
            code(MonitorError::Orchestrator(OrchestratorError::DiscoveryMiss {
                service: "vllm".into()
            })),
            DISCOVERY_MISS
        );
    }

    #[test]
    fn exporting_from_an_unplaced_monitor_is_no_such_instance() {
        let pending = MonitorError::NotRunning {
            id: "3f2a9c1e".into(),
            status: "PENDING".into(),
        };
        assert_eq!(code(pending), NO_SUCH_INSTANCE);
        assert_eq!(code(MonitorError::NoSuchInstance("3f2a".into())), NO_SUCH_INSTANCE);
    }

    #[test]
    fn context_layers_are_looked_through() {
        let err: anyhow::Result<()> = Err(OrchestratorError::NoSuchInstance("abc".into()))
            .context("status of abc");
        assert_eq!(exit_code(&err.unwrap_err()), NO_SUCH_INSTANCE);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), GENERIC);
        assert_eq!(code(UsageError("bad".into())), VALIDATION);
        assert_eq!(code(StateError::Locked { path: "db".into() }), STORE);
    }
}
