//! Scheduler and orchestrator error types.

use std::time::Duration;

use thiserror::Error;

/// Errors talking to the batch system.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler command could not be run or did not answer in time.
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),

    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected scheduler output: {0}")]
    Parse(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Typed outcomes of orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid deployment: {0}")]
    Validation(String),

    #[error(transparent)]
    Recipe(#[from] ubench_core::RecipeError),

    #[error("submission of '{recipe}' failed: {source}")]
    Submission {
        recipe: String,
        #[source]
        source: SchedulerError,
    },

    #[error("instance {instance_id} (job {handle}) was not placed within {}s; it stays PENDING, check it later with `status`", waited.as_secs())]
    PlacementTimeout {
        instance_id: String,
        handle: String,
        waited: Duration,
    },

    #[error("job {handle} will not be placed: {reason}")]
    PlacementFailed { handle: String, reason: String },

    #[error("job {handle} has not been assigned a host yet")]
    NotYetPlaced { handle: String },

    #[error("no service registered as '{service}'; start its server first or run `ubench discover update {service} <job-id>`")]
    DiscoveryMiss { service: String },

    #[error("no such instance: {0}")]
    NoSuchInstance(String),

    #[error("ambiguous instance id prefix '{0}'")]
    AmbiguousInstance(String),

    #[error("wait for instance {0} was interrupted")]
    Interrupted(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("state store error: {0}")]
    Store(#[from] ubench_state::StateError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
