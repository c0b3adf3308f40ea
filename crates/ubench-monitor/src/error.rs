//! Monitor error types.

use thiserror::Error;

use ubench_scheduler::OrchestratorError;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor '{monitor}' resolved no scrape targets; start the monitored server or pass its job id")]
    NoTargetsResolved { monitor: String },

    #[error("collector at {url} is unreachable: {reason}")]
    CollectorUnreachable { url: String, reason: String },

    /// The collector answered but rejected the request.
    #[error("collector query '{query}' failed: {message}")]
    Query { query: String, message: String },

    #[error("no such monitor: {0}")]
    NoSuchInstance(String),

    #[error("monitor {id} is {status}; it must be RUNNING")]
    NotRunning { id: String, status: String },

    #[error("invalid export request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Recipe(#[from] ubench_core::RecipeError),

    #[error("state store error: {0}")]
    Store(#[from] ubench_state::StateError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MonitorResult<T> = Result<T, MonitorError>;
