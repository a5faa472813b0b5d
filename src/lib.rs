//! # Result Merge
//!
//! Reconciles the partial outputs of a data-parallel loop into one matrix.
//!
//! Every iteration group of a parallel loop produces a partial copy of a
//! shared output matrix. After the loop, the partials are merged against the
//! baseline (the output's state before the loop) by a map/shuffle/reduce job:
//! mappers tag each record with its provenance, the shuffle routes and orders
//! records by key with baseline records first, and reducers pick one winning
//! value per key.
//!
//! Three physical encodings are supported: sparse text cells, dense indexed
//! binary cells, and partitioned binary blocks.
//!
//! ```no_run
//! use resultmerge::{MatrixHandle, MatrixObject, MergeConfig, MergeCoordinator};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let coordinator = MergeCoordinator::local(MergeConfig::from_env(None)?);
//! let baseline: Arc<dyn MatrixObject> = Arc::new(MatrixHandle::open("data/R")?);
//! let p0: Arc<dyn MatrixObject> = Arc::new(MatrixHandle::open("data/R_p0")?);
//! let p1: Arc<dyn MatrixObject> = Arc::new(MatrixHandle::open("data/R_p1")?);
//! let partials = vec![Some(p0), Some(p1)];
//! let merged = coordinator.merge(&baseline, &partials, Path::new("data/R_merged"), 1)?;
//! println!("{} nnz={}", merged.var_name(), merged.characteristics().nnz);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod formats;
pub mod job;
pub mod matrix;
pub mod merge;
pub mod model;
pub mod resolver;
pub mod strategy;
pub mod tagged;
pub mod test_support;

// Re-export main types for convenience
pub use config::{ConfigOverrides, JobOverrides, JobSettings, MergeConfig, ShuffleSettings};
pub use error::MergeError;
pub use job::{
    FaultInjector, JobReport, JobRunner, LocalJobRunner, MergeInput, MergeJobDescriptor,
    RunnerStatistics, TaskKind, TaskPolicy,
};
pub use matrix::{InMemoryMatrix, MatrixHandle, MatrixObject};
pub use merge::{merged_name, reducer_count, MergeCoordinator};
pub use model::{BlockIndex, CellIndex, MatrixBlock, MatrixCharacteristics, MatrixFormat};
pub use resolver::{resolve_cell, BlockMerger, CellResolver};
pub use tagged::{Tag, TaggedRecord};
