//! PlacementResolver: where did a job land?
//!
//! `resolve` asks the scheduler once. `wait_for_placement` polls until the
//! job is placed, fails, the wait budget runs out or the caller cancels.
//! Neither touches any state; callers decide what an outcome means.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use ubench_state::epoch_secs;

use crate::error::SchedulerResult;
use crate::slurm::{BatchScheduler, JobStatus};

/// A resolved job location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub host: String,
    pub resolved_at: u64,
}

/// One answer from [`PlacementResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Queued or allocating; ask again later.
    Pending,
    Resolved(Placement),
    /// Ended without (or after) running, or unknown to the scheduler.
    Failed(String),
}

/// Polling budget for [`PlacementResolver::wait_for_placement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Resolved(Placement),
    Failed(String),
    /// The budget ran out. Carries the last transport error, if any.
    Timeout { last_error: Option<String> },
    Cancelled,
}

/// Stateless read-through over a [`BatchScheduler`].
#[derive(Clone)]
pub struct PlacementResolver {
    scheduler: Arc<dyn BatchScheduler>,
}

impl PlacementResolver {
    pub fn new(scheduler: Arc<dyn BatchScheduler>) -> Self {
        Self { scheduler }
    }

    /// Ask the scheduler once. Transport failures are returned as errors.
    pub async fn resolve(&self, handle: &str) -> SchedulerResult<Resolution> {
        let status = self.scheduler.query(handle).await?;
        debug!(%handle, ?status, "job queried");
        Ok(match status {
            JobStatus::Pending { .. } | JobStatus::Running { host: None } => Resolution::Pending,
            JobStatus::Running { host: Some(host) } => Resolution::Resolved(Placement {
                host,
                resolved_at: epoch_secs(),
            }),
            JobStatus::Finished { state } => {
                Resolution::Failed(format!("job {handle} ended in state {state}"))
            }
            JobStatus::Unknown => {
                Resolution::Failed(format!("job {handle} is not known to the scheduler"))
            }
        })
    }

    /// Poll until the job is placed or fails, within `opts.timeout`.
    pub async fn wait_for_placement(
        &self,
        handle: &str,
        opts: &WaitOptions,
        cancel: watch::Receiver<bool>,
    ) -> WaitOutcome {
        self.wait_for_placement_with(handle, opts, cancel, |_| true)
            .await
    }

    /// Like [`wait_for_placement`](Self::wait_for_placement), calling
    /// `observe` with every answer the scheduler gives. Returning `false`
    /// from `observe` ends the wait with [`WaitOutcome::Cancelled`].
    pub async fn wait_for_placement_with<F>(
        &self,
        handle: &str,
        opts: &WaitOptions,
        mut cancel: watch::Receiver<bool>,
        mut observe: F,
    ) -> WaitOutcome
    where
        F: FnMut(&Resolution) -> bool + Send,
    {
        let deadline = Instant::now() + opts.timeout;
        let mut last_error = None;
        let mut attempt = 0u32;

        loop {
            if *cancel.borrow() {
                return WaitOutcome::Cancelled;
            }
            attempt += 1;

            match self.resolve(handle).await {
                Ok(resolution) => {
                    if !observe(&resolution) {
                        debug!(%handle, attempt, "placement wait aborted by observer");
                        return WaitOutcome::Cancelled;
                    }
                    match resolution {
                        Resolution::Resolved(placement) => {
                            debug!(%handle, attempt, host = %placement.host, "placement resolved");
                            return WaitOutcome::Resolved(placement);
                        }
                        Resolution::Failed(reason) => return WaitOutcome::Failed(reason),
                        Resolution::Pending => {
                            debug!(%handle, attempt, "job still pending");
                        }
                    }
                }
                Err(e) => {
                    warn!(%handle, attempt, error = %e, "scheduler query failed, retrying");
                    last_error = Some(e.to_string());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Timeout { last_error };
            }
            let nap = opts.poll_interval.min(deadline - now);

            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                changed = cancel.changed() => match changed {
                    Ok(()) if *cancel.borrow() => return WaitOutcome::Cancelled,
                    Ok(()) => {}
                    // Nobody can cancel any more; just wait out the interval.
                    Err(_) => tokio::time::sleep(nap).await,
                },
            }
        }
    }
}
