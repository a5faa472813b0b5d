//! Default constants for result merge configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Job Defaults
// =============================================================================

/// Default upper bound on reduce tasks per merge job.
pub const DEFAULT_REDUCER_CAP: usize = 64;

/// Default replication factor of the merged output.
pub const DEFAULT_REPLICATION: u16 = 1;

/// Default maximum attempts per map or reduce task before the job fails.
pub const DEFAULT_MAX_TASK_ATTEMPTS: u32 = 4;

/// Cells assigned to one reducer when sizing cell-format jobs.
/// Small outputs get a single reducer instead of many near-empty ones.
pub const DEFAULT_CELL_BUFFER_SIZE: u64 = 100_000;

/// Whether worker threads are kept across jobs.
pub const DEFAULT_WORKER_REUSE: bool = true;

/// Default mapper parallelism: one worker per available core.
pub fn default_mapper_count() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(8)
}

// =============================================================================
// Shuffle Defaults
// =============================================================================

/// Capacity (in batches) of the bounded map-output channel.
pub const DEFAULT_SHUFFLE_CHANNEL_CAPACITY: usize = 64;

/// Records per committed map-output batch.
pub const DEFAULT_SHUFFLE_BATCH_SIZE: usize = 4096;

// =============================================================================
// Naming
// =============================================================================

/// Suffix appended to the baseline's variable name for the merged output.
pub const MERGED_NAME_SUFFIX: &str = "_rm";

/// Prefix of merge job names.
pub const JOB_NAME_PREFIX: &str = "ResultMerge-";
