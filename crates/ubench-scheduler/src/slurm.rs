//! Batch scheduler seam and its SLURM implementation.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{SchedulerError, SchedulerResult};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What the scheduler knows about one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued, configuring, requeued or suspended.
    Pending { state: String },
    /// Running. `host` is the first allocated node, when reported.
    Running { host: Option<String> },
    /// Ended for any reason (completed, failed, cancelled, timed out, ...).
    Finished { state: String },
    /// The scheduler has no record of this handle.
    Unknown,
}

impl JobStatus {
    pub fn pending() -> Self {
        JobStatus::Pending {
            state: "PENDING".to_string(),
        }
    }

    pub fn running(host: &str) -> Self {
        JobStatus::Running {
            host: Some(host.to_string()),
        }
    }

    pub fn finished(state: &str) -> Self {
        JobStatus::Finished {
            state: state.to_string(),
        }
    }
}

/// Result of asking the scheduler to cancel a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The handle is unknown or the job already ended.
    NotFound,
}

/// The operations ubench needs from a batch system.
pub trait BatchScheduler: Send + Sync {
    /// Submit a batch script. Returns the job handle.
    fn submit<'a>(&'a self, script: &'a str) -> BoxFuture<'a, SchedulerResult<String>>;

    /// Current lifecycle state and placement of a job.
    fn query<'a>(&'a self, handle: &'a str) -> BoxFuture<'a, SchedulerResult<JobStatus>>;

    fn cancel<'a>(&'a self, handle: &'a str) -> BoxFuture<'a, SchedulerResult<CancelOutcome>>;
}

/// SLURM through its command line tools.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    sbatch: String,
    squeue: String,
    sacct: String,
    scancel: String,
    command_timeout: Duration,
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            squeue: "squeue".to_string(),
            sacct: "sacct".to_string(),
            scancel: "scancel".to_string(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

impl SlurmScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up on any single scheduler command after `timeout`.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    async fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> SchedulerResult<Output> {
        let command = format!("{program} {}", args.join(" "));
        let run = async {
            let mut child = Command::new(program)
                .args(args)
                .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| SchedulerError::Unavailable(format!("{program}: {e}")))?;
            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(input.as_bytes())
                    .await
                    .map_err(|e| SchedulerError::Unavailable(format!("{program}: {e}")))?;
            }
            let out = child
                .wait_with_output()
                .await
                .map_err(|e| SchedulerError::Unavailable(format!("{program}: {e}")))?;
            Ok(Output {
                success: out.status.success(),
                status: out.status.to_string(),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            })
        };
        match tokio::time::timeout(self.command_timeout, run).await {
            Ok(result) => {
                debug!(%command, ok = result.as_ref().map(|o| o.success).unwrap_or(false), "scheduler command finished");
                result
            }
            Err(_) => Err(SchedulerError::Unavailable(format!(
                "`{command}` did not finish within {:?}",
                self.command_timeout
            ))),
        }
    }

    async fn submit_script(&self, script: &str) -> SchedulerResult<String> {
        let out = self.run(&self.sbatch, &[], Some(script)).await?;
        if !out.success {
            return Err(out.failed(&self.sbatch));
        }
        let handle = parse_sbatch_output(&out.stdout)?;
        info!(%handle, "batch job submitted");
        Ok(handle)
    }

    async fn query_job(&self, handle: &str) -> SchedulerResult<JobStatus> {
        let out = self
            .run(&self.squeue, &["-h", "-j", handle, "-o", "%T|%N"], None)
            .await?;
        if !out.success {
            if is_unknown_job(&out.stderr) {
                return self.accounting_state(handle).await;
            }
            return Err(out.failed(&self.squeue));
        }
        match out.stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
            Some(line) => parse_squeue_line(line),
            // Jobs disappear from the queue shortly after they end.
            None => self.accounting_state(handle).await,
        }
    }

    /// Final state from accounting, for jobs no longer in the queue.
    async fn accounting_state(&self, handle: &str) -> SchedulerResult<JobStatus> {
        let out = match self
            .run(&self.sacct, &["-n", "-X", "-P", "-j", handle, "-o", "State"], None)
            .await
        {
            Ok(out) if out.success => out,
            // No accounting on this cluster: the job is simply gone.
            _ => return Ok(JobStatus::Unknown),
        };
        let state = out
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .and_then(|l| l.split_whitespace().next())
            .map(str::to_string);
        Ok(match state {
            Some(state) => status_from_state(&state, None),
            None => JobStatus::Unknown,
        })
    }

    async fn cancel_job(&self, handle: &str) -> SchedulerResult<CancelOutcome> {
        let out = self.run(&self.scancel, &[handle], None).await?;
        if out.success {
            info!(%handle, "batch job cancelled");
            return Ok(CancelOutcome::Cancelled);
        }
        if is_unknown_job(&out.stderr) || out.stderr.contains("already completing or completed") {
            info!(%handle, "batch job already gone");
            return Ok(CancelOutcome::NotFound);
        }
        Err(out.failed(&self.scancel))
    }
}

impl BatchScheduler for SlurmScheduler {
    fn submit<'a>(&'a self, script: &'a str) -> BoxFuture<'a, SchedulerResult<String>> {
        Box::pin(self.submit_script(script))
    }

    fn query<'a>(&'a self, handle: &'a str) -> BoxFuture<'a, SchedulerResult<JobStatus>> {
        Box::pin(self.query_job(handle))
    }

    fn cancel<'a>(&'a self, handle: &'a str) -> BoxFuture<'a, SchedulerResult<CancelOutcome>> {
        Box::pin(self.cancel_job(handle))
    }
}

struct Output {
    success: bool,
    status: String,
    stdout: String,
    stderr: String,
}

impl Output {
    fn failed(&self, program: &str) -> SchedulerError {
        SchedulerError::CommandFailed {
            command: program.to_string(),
            status: self.status.clone(),
            stderr: self.stderr.clone(),
        }
    }
}

fn is_unknown_job(stderr: &str) -> bool {
    stderr.contains("Invalid job id")
}

// ── Output parsing ─────────────────────────────────────────────────

/// Job handle from `sbatch` output: `Submitted batch job 123456`, or the
/// `123456[;cluster]` form printed with `--parsable`.
pub fn parse_sbatch_output(stdout: &str) -> SchedulerResult<String> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .ok_or_else(|| SchedulerError::Parse("sbatch printed nothing".to_string()))?;
    let token = line.split_whitespace().last().unwrap_or(line);
    let handle = token.split(';').next().unwrap_or(token);
    if handle.is_empty() || !handle.chars().all(|c| c.is_ascii_digit()) {
        return Err(SchedulerError::Parse(format!("no job id in sbatch output: {line}")));
    }
    Ok(handle.to_string())
}

/// Parse one `%T|%N` line from `squeue`.
pub fn parse_squeue_line(line: &str) -> SchedulerResult<JobStatus> {
    let (state, nodes) = line
        .split_once('|')
        .ok_or_else(|| SchedulerError::Parse(format!("squeue line without separator: {line}")))?;
    Ok(status_from_state(state.trim(), Some(nodes.trim())))
}

fn status_from_state(state: &str, nodes: Option<&str>) -> JobStatus {
    let state = state.to_ascii_uppercase();
    match state.as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESIZING"
        | "SUSPENDED" => JobStatus::Pending { state },
        "RUNNING" => JobStatus::Running {
            host: nodes.and_then(first_host),
        },
        _ => JobStatus::Finished { state },
    }
}

/// First host of a SLURM node list: `mel[2013-2014],gpu01` → `mel2013`.
pub fn first_host(nodelist: &str) -> Option<String> {
    let nodelist = nodelist.trim();
    if nodelist.is_empty() || nodelist.starts_with('(') || nodelist.eq_ignore_ascii_case("n/a") {
        return None;
    }

    // First top-level entry; commas inside brackets separate ranges.
    let mut depth = 0usize;
    let mut end = nodelist.len();
    for (i, c) in nodelist.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                end = i;
                break;
            }
            _ => {}
        }
    }
    let entry = &nodelist[..end];

    match entry.split_once('[') {
        None => Some(entry.to_string()),
        Some((prefix, rest)) => {
            let (ranges, suffix) = rest.split_once(']')?;
            let first = ranges.split(',').next()?.split('-').next()?.trim();
            if first.is_empty() {
                return None;
            }
            Some(format!("{prefix}{first}{suffix}"))
        }
    }
}
