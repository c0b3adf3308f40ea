//! In-memory scheduler for tests.
//!
//! Jobs follow a scripted sequence of states: each query consumes one
//! entry, and the last entry repeats forever. Handles count up from 1000.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::error::{SchedulerError, SchedulerResult};
use crate::slurm::{BatchScheduler, BoxFuture, CancelOutcome, JobStatus};

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    jobs: HashMap<String, VecDeque<JobStatus>>,
    default_sequence: Vec<JobStatus>,
    submitted: Vec<(String, String)>,
    cancelled: Vec<String>,
    failing_submissions: u32,
    failing_queries: u32,
    queries: u32,
}

/// Scriptable [`BatchScheduler`].
#[derive(Default)]
pub struct FakeScheduler {
    state: Mutex<FakeState>,
}

impl FakeScheduler {
    /// Every submitted job runs on `fake-node` straight away unless scripted.
    pub fn new() -> Self {
        Self::with_default_sequence(vec![JobStatus::running("fake-node")])
    }

    /// Sequence given to every newly submitted job.
    pub fn with_default_sequence(sequence: Vec<JobStatus>) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.lock();
            state.next_handle = 1000;
            state.default_sequence = sequence;
        }
        fake
    }

    /// Script the states an existing or future handle reports.
    pub fn script(&self, handle: &str, sequence: Vec<JobStatus>) {
        self.lock()
            .jobs
            .insert(handle.to_string(), sequence.into_iter().collect());
    }

    /// Make the scheduler forget a job, as if it was purged.
    pub fn forget(&self, handle: &str) {
        self.lock().jobs.remove(handle);
    }

    /// The next `n` submissions fail.
    pub fn fail_next_submissions(&self, n: u32) {
        self.lock().failing_submissions = n;
    }

    /// The next `n` queries fail with a transport error.
    pub fn fail_next_queries(&self, n: u32) {
        self.lock().failing_queries = n;
    }

    /// `(handle, script)` for every accepted submission, in order.
    pub fn submitted(&self) -> Vec<(String, String)> {
        self.lock().submitted.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    pub fn query_count(&self) -> u32 {
        self.lock().queries
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn do_submit(&self, script: &str) -> SchedulerResult<String> {
        let mut state = self.lock();
        if state.failing_submissions > 0 {
            state.failing_submissions -= 1;
            return Err(SchedulerError::CommandFailed {
                command: "sbatch".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "sbatch: error: Batch job submission failed".to_string(),
            });
        }
        let handle = state.next_handle.to_string();
        state.next_handle += 1;
        let sequence = state.default_sequence.clone();
        state
            .jobs
            .entry(handle.clone())
            .or_insert_with(|| sequence.into_iter().collect());
        state.submitted.push((handle.clone(), script.to_string()));
        Ok(handle)
    }

    fn do_query(&self, handle: &str) -> SchedulerResult<JobStatus> {
        let mut state = self.lock();
        state.queries += 1;
        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(SchedulerError::Unavailable("squeue: connection refused".to_string()));
        }
        let Some(sequence) = state.jobs.get_mut(handle) else {
            return Ok(JobStatus::Unknown);
        };
        let status = if sequence.len() > 1 {
            sequence.pop_front()
        } else {
            sequence.front().cloned()
        };
        Ok(status.unwrap_or(JobStatus::Unknown))
    }

    fn do_cancel(&self, handle: &str) -> SchedulerResult<CancelOutcome> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.jobs.get_mut(handle) {
            Some(sequence) if !matches!(sequence.front(), Some(JobStatus::Finished { .. })) => {
                *sequence = VecDeque::from([JobStatus::finished("CANCELLED")]);
                state.cancelled.push(handle.to_string());
                Ok(CancelOutcome::Cancelled)
            }
            _ => Ok(CancelOutcome::NotFound),
        }
    }
}

impl BatchScheduler for FakeScheduler {
    fn submit<'a>(&'a self, script: &'a str) -> BoxFuture<'a, SchedulerResult<String>> {
        Box::pin(async move { self.do_submit(script) })
    }

    fn query<'a>(&'a self, handle: &'a str) -> BoxFuture<'a, SchedulerResult<JobStatus>> {
        Box::pin(async move { self.do_query(handle) })
    }

    fn cancel<'a>(&'a self, handle: &'a str) -> BoxFuture<'a, SchedulerResult<CancelOutcome>> {
        Box::pin(async move { self.do_cancel(handle) })
    }
}
