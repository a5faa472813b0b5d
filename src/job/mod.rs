//! # Merge Job
//!
//! The distributed map/shuffle/reduce job that reconciles partial results.
//!
//! ## Architecture
//!
//! ```text
//!   baseline (Compare)   partial 0 (Data 0) ... partial n (Data n)
//!          │                   │                     │
//!   ┌──────▼───────────────────▼─────────────────────▼──────┐
//!   │      map tasks: one per part file, tag every record    │
//!   └──────────────────────────┬────────────────────────────┘
//!                              │ bounded channel, committed batches
//!   ┌──────────────────────────▼────────────────────────────┐
//!   │  shuffle: range-partition by key, sort (key, tag),    │
//!   │           group by key                                │
//!   └──────────────────────────┬────────────────────────────┘
//!          ┌───────────────────┼───────────────────┐
//!   reduce task 0        reduce task 1  ...  reduce task R-1
//!          └───────────────────┴───────────────────┘
//!                 staged part files, committed atomically
//! ```

pub mod runner;
pub mod shuffle;
pub mod task;

pub use runner::{JobRunner, LocalJobRunner};
pub use task::{FaultInjector, TaskKind, TaskPolicy};

use crate::model::{MatrixCharacteristics, MatrixFormat};
use crate::tagged::Tag;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// One input location of a merge job with its provenance tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeInput {
    pub path: PathBuf,
    pub tag: Tag,
}

/// Immutable description of one merge job, built once per merge call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeJobDescriptor {
    /// Job name used in logs and errors
    pub name: String,
    /// Baseline (if compared) followed by the partials
    pub inputs: Vec<MergeInput>,
    /// Final output location; never one of the inputs
    pub output: PathBuf,
    pub format: MatrixFormat,
    /// Shape and blocking of the output (nnz is not used)
    pub characteristics: MatrixCharacteristics,
    /// Worker parallelism hint
    pub num_mappers: usize,
    /// Exact number of reduce tasks
    pub num_reducers: usize,
    pub policy: TaskPolicy,
}

impl MergeJobDescriptor {
    /// True if the baseline participates as a `Compare` source.
    pub fn with_compare(&self) -> bool {
        self.inputs.iter().any(|input| input.tag.is_compare())
    }

    pub fn source_count(&self) -> usize {
        self.inputs.len()
    }
}

/// Outcome of a successful merge job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    /// Non-zero cells written by all reducers
    pub nnz: u64,
    pub map_tasks: usize,
    pub reduce_tasks: usize,
    /// Attempts across all tasks, including failed ones
    pub task_attempts: u64,
    pub failed_attempts: u64,
    pub replication: u16,
}

/// Monotonic counters kept by a job runner.
#[derive(Debug, Default)]
pub struct RunnerStatistics {
    pub jobs_submitted: AtomicU64,
    pub jobs_succeeded: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub task_attempts: AtomicU64,
    pub task_failures: AtomicU64,
}

/// Point-in-time copy of [`RunnerStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunnerStatisticsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub task_attempts: u64,
    pub task_failures: u64,
}

impl RunnerStatistics {
    pub fn snapshot(&self) -> RunnerStatisticsSnapshot {
        RunnerStatisticsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            task_attempts: self.task_attempts.load(Ordering::Relaxed),
            task_failures: self.task_failures.load(Ordering::Relaxed),
        }
    }
}
