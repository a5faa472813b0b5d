//! Configuration for result merge jobs.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (resultmerge.toml)
//! ```toml
//! [job]
//! mappers = 16
//! reducer_cap = 128
//! replication = 3
//! max_task_attempts = 4
//! worker_reuse = true
//!
//! [shuffle]
//! channel_capacity = 64
//! batch_size = 4096
//! ```
//!
//! Environment variables use the `RESULTMERGE_` prefix with `__` between
//! levels, e.g. `RESULTMERGE_JOB__REDUCER_CAP=32`.

mod defaults;

pub use defaults::*;

use crate::error::MergeError;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration for the merge coordinator and local job runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Per-job sizing and fault settings
    pub job: JobSettings,
    /// Map-to-reduce transfer settings
    pub shuffle: ShuffleSettings,
}

impl MergeConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self, MergeError> {
        let mut figment = Figment::new().merge(Serialized::defaults(MergeConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with RESULTMERGE_ prefix
        figment = figment.merge(Env::prefixed("RESULTMERGE_").split("__"));

        // Layer 3: CLI overrides
        figment = figment.merge(Serialized::defaults(overrides));

        let config: MergeConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&Path>) -> Result<Self, MergeError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    pub fn validate(&self) -> Result<(), MergeError> {
        let job = &self.job;
        if job.mappers == 0 {
            return Err(MergeError::config("job.mappers must be at least 1"));
        }
        if job.reducer_cap == 0 {
            return Err(MergeError::config("job.reducer_cap must be at least 1"));
        }
        if job.replication == 0 {
            return Err(MergeError::config("job.replication must be at least 1"));
        }
        if job.max_task_attempts == 0 {
            return Err(MergeError::config("job.max_task_attempts must be at least 1"));
        }
        if job.cell_buffer_size == 0 {
            return Err(MergeError::config("job.cell_buffer_size must be at least 1"));
        }
        if self.shuffle.channel_capacity == 0 || self.shuffle.batch_size == 0 {
            return Err(MergeError::config(
                "shuffle.channel_capacity and shuffle.batch_size must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Sizing and fault-tolerance settings applied to every merge job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Mapper parallelism hint (worker pool size)
    pub mappers: usize,
    /// Upper bound on reduce tasks
    pub reducer_cap: usize,
    /// Replication factor for the merged output
    pub replication: u16,
    /// Maximum attempts per task
    pub max_task_attempts: u32,
    /// Keep worker threads across jobs
    pub worker_reuse: bool,
    /// Cells per reducer for cell-format sizing
    pub cell_buffer_size: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            mappers: default_mapper_count(),
            reducer_cap: DEFAULT_REDUCER_CAP,
            replication: DEFAULT_REPLICATION,
            max_task_attempts: DEFAULT_MAX_TASK_ATTEMPTS,
            worker_reuse: DEFAULT_WORKER_REUSE,
            cell_buffer_size: DEFAULT_CELL_BUFFER_SIZE,
        }
    }
}

/// Map-output transfer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuffleSettings {
    /// Bounded channel capacity, in batches
    pub channel_capacity: usize,
    /// Records per batch
    pub batch_size: usize,
}

impl Default for ShuffleSettings {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_SHUFFLE_CHANNEL_CAPACITY,
            batch_size: DEFAULT_SHUFFLE_BATCH_SIZE,
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mappers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reducer_cap: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_task_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_reuse: Option<bool>,
}
