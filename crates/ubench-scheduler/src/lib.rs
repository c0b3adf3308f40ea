//! ubench-scheduler — from recipe to running batch job.
//!
//! - [`BatchScheduler`] is the seam to the cluster's batch system;
//!   [`SlurmScheduler`] drives `sbatch`, `squeue`, `sacct` and `scancel`.
//! - [`PlacementResolver`] turns a job handle into a placement, either once
//!   ([`PlacementResolver::resolve`]) or by polling until the job lands on a
//!   host, fails, times out or is cancelled.
//! - [`DeploymentOrchestrator`] owns the instance state machine: it renders
//!   and submits batch scripts, drives instances to a placement, publishes
//!   servers in the discovery registry and mirrors everything into the
//!   instance store.

pub mod client;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod orchestrator;
pub mod resolver;
pub mod script;
pub mod slurm;

pub use error::{OrchestratorError, OrchestratorResult, SchedulerError, SchedulerResult};
pub use orchestrator::{
    DeployReport, DeploymentOrchestrator, OrchestratorSettings, ReplicaFailure, StopOutcome,
};
pub use resolver::{Placement, PlacementResolver, Resolution, WaitOptions, WaitOutcome};
pub use script::{DeploymentUnit, render_batch_script};
pub use slurm::{BatchScheduler, BoxFuture, CancelOutcome, JobStatus, SlurmScheduler};
