//! Task execution policy: bounded attempts, timeouts, and fault injection.

use crate::config::JobSettings;
use crate::job::RunnerStatistics;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fault and resource settings applied to every task of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskPolicy {
    /// Attempts per task before the job fails; at least 1.
    pub max_attempts: u32,
    /// Per-attempt time limit; `None` disables it.
    pub task_timeout: Option<Duration>,
    /// Run duplicate attempts of slow tasks.
    pub speculative_execution: bool,
    /// Replication factor of the output.
    pub replication: u16,
    /// Keep worker threads across jobs.
    pub worker_reuse: bool,
}

impl TaskPolicy {
    /// Policy for result merge jobs.
    ///
    /// Merge tasks over skewed blocks may run long, so no timeout applies.
    /// Speculative attempts could apply the same `Data` records twice, so
    /// they are never enabled.
    pub fn for_result_merge(settings: &JobSettings) -> Self {
        Self {
            max_attempts: settings.max_task_attempts.max(1),
            task_timeout: None,
            speculative_execution: false,
            replication: settings.replication,
            worker_reuse: settings.worker_reuse,
        }
    }
}

/// Phase a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Map,
    Reduce,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Map => f.write_str("map"),
            TaskKind::Reduce => f.write_str("reduce"),
        }
    }
}

/// Decides whether a task attempt should fail artificially.
///
/// Used to exercise retry and cleanup paths.
pub trait FaultInjector: Send + Sync {
    fn should_fail(&self, kind: TaskKind, task: usize, attempt: u32) -> bool;
}

impl<F> FaultInjector for F
where
    F: Fn(TaskKind, usize, u32) -> bool + Send + Sync,
{
    fn should_fail(&self, kind: TaskKind, task: usize, attempt: u32) -> bool {
        self(kind, task, attempt)
    }
}

/// Run `body` until it succeeds or the policy's attempts are exhausted.
///
/// `body` receives the 1-based attempt number. Each attempt must leave no
/// externally visible output when it fails.
pub fn run_with_retries<T>(
    kind: TaskKind,
    task: usize,
    policy: &TaskPolicy,
    stats: &RunnerStatistics,
    mut body: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        stats.task_attempts.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = body(attempt).and_then(|value| match policy.task_timeout {
            Some(limit) if started.elapsed() > limit => Err(anyhow!(
                "attempt exceeded task timeout of {limit:?}"
            )),
            _ => Ok(value),
        });
        match outcome {
            Ok(value) => {
                debug!(%kind, task, attempt, "task attempt succeeded");
                return Ok(value);
            }
            Err(e) => {
                stats.task_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%kind, task, attempt, error = %format!("{e:#}"), "task attempt failed");
                last_error = Some(e);
            }
        }
    }
    let error = last_error.unwrap_or_else(|| anyhow!("no attempts allowed"));
    Err(error.context(format!(
        "{kind} task {task} failed after {} attempts",
        policy.max_attempts
    )))
}
