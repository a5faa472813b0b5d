//! Job runners: the substrate that executes a [`MergeJobDescriptor`].
//!
//! [`LocalJobRunner`] runs map and reduce tasks on a rayon pool and moves
//! committed map output through a bounded crossbeam channel. Reduce output
//! is staged next to the final location and renamed into place only after
//! every task succeeded, so a failed job never exposes partial output.

use super::shuffle::{
    collect_map_output, group_by_key, sort_partition, MapOutputBatch, RangePartitioner,
};
use super::task::{run_with_retries, FaultInjector, TaskKind, TaskPolicy};
use super::{JobReport, MergeJobDescriptor, RunnerStatistics};
use crate::config::{MergeConfig, ShuffleSettings};
use crate::error::MergeError;
use crate::formats::{list_part_files, locations_overlap, part_file_name};
use crate::matrix::metadata_path;
use crate::model::MatrixFormat;
use crate::strategy::{BinaryBlockStrategy, BinaryCellStrategy, FormatStrategy, TextCellStrategy};
use crate::tagged::{Tag, TaggedRecord};
use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Marker written into a committed output directory.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

const ATTEMPTS_DIR: &str = "_attempts";

/// Executes merge jobs.
pub trait JobRunner: Send + Sync {
    /// Run a job to completion. On error no output exists at `job.output`.
    fn submit(&self, job: &MergeJobDescriptor) -> Result<JobReport, MergeError>;
}

/// Scratch location a job writes to before its output is committed.
pub fn staging_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push("._temporary");
    PathBuf::from(name)
}

/// In-process job runner backed by a rayon worker pool.
pub struct LocalJobRunner {
    shuffle: ShuffleSettings,
    shared_pool: Mutex<Option<Arc<ThreadPool>>>,
    fault_injector: Option<Arc<dyn FaultInjector>>,
    stats: Arc<RunnerStatistics>,
}

impl LocalJobRunner {
    pub fn new(shuffle: ShuffleSettings) -> Self {
        Self {
            shuffle,
            shared_pool: Mutex::new(None),
            fault_injector: None,
            stats: Arc::new(RunnerStatistics::default()),
        }
    }

    pub fn from_config(config: &MergeConfig) -> Self {
        Self::new(config.shuffle.clone())
    }

    /// Fail task attempts chosen by `injector`.
    pub fn with_fault_injector(mut self, injector: Arc<dyn FaultInjector>) -> Self {
        self.fault_injector = Some(injector);
        self
    }

    pub fn statistics(&self) -> Arc<RunnerStatistics> {
        Arc::clone(&self.stats)
    }

    /// Worker pool for a job. With worker reuse the pool is cached and shared
    /// by later jobs of the same width.
    fn pool(&self, threads: usize, reuse: bool) -> Result<Arc<ThreadPool>> {
        let threads = threads.max(1);
        if !reuse {
            return Ok(Arc::new(build_pool(threads)?));
        }
        let mut cached = self.shared_pool.lock();
        if let Some(pool) = cached.as_ref() {
            if pool.current_num_threads() == threads {
                return Ok(Arc::clone(pool));
            }
        }
        let pool = Arc::new(build_pool(threads)?);
        *cached = Some(Arc::clone(&pool));
        Ok(pool)
    }

    fn run(&self, job: &MergeJobDescriptor, stats: &RunnerStatistics) -> Result<JobReport> {
        check_descriptor(job)?;
        let output = job.output.as_path();
        let staging = staging_path(output);

        remove_location(output)?;
        remove_location(&metadata_path(output))?;
        remove_location(&staging)?;
        fs::create_dir_all(staging.join(ATTEMPTS_DIR))
            .with_context(|| format!("create staging {}", staging.display()))?;

        let pool = self.pool(job.num_mappers, job.policy.worker_reuse)?;
        let ctx = JobContext {
            policy: &job.policy,
            shuffle: &self.shuffle,
            injector: self.fault_injector.as_deref(),
            stats,
            pool: &pool,
            staging: &staging,
        };
        let mc = job.characteristics;
        let executed = match job.format {
            MatrixFormat::TextCell => ctx.execute(job, &TextCellStrategy::new(mc)),
            MatrixFormat::BinaryCell => ctx.execute(job, &BinaryCellStrategy::new(mc)),
            MatrixFormat::BinaryBlock => ctx.execute(job, &BinaryBlockStrategy::new(mc)),
        }
        .and_then(|executed| {
            commit(&staging, output)?;
            Ok(executed)
        });

        match executed {
            Ok((nnz, map_tasks)) => {
                debug!(replication = job.policy.replication, "local output written once");
                let snapshot = stats.snapshot();
                Ok(JobReport {
                    nnz,
                    map_tasks,
                    reduce_tasks: job.num_reducers,
                    task_attempts: snapshot.task_attempts,
                    failed_attempts: snapshot.task_failures,
                    replication: job.policy.replication,
                })
            }
            Err(e) => {
                if let Err(cleanup) = remove_location(&staging) {
                    error!(error = %cleanup, "failed to remove staging directory");
                }
                Err(e)
            }
        }
    }
}

impl JobRunner for LocalJobRunner {
    #[instrument(skip(self, job), fields(job = %job.name, format = %job.format, reducers = job.num_reducers))]
    fn submit(&self, job: &MergeJobDescriptor) -> Result<JobReport, MergeError> {
        self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        let job_stats = RunnerStatistics::default();
        let result = self.run(job, &job_stats);

        let snapshot = job_stats.snapshot();
        self.stats
            .task_attempts
            .fetch_add(snapshot.task_attempts, Ordering::Relaxed);
        self.stats
            .task_failures
            .fetch_add(snapshot.task_failures, Ordering::Relaxed);

        match result {
            Ok(report) => {
                self.stats.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
                info!(
                    nnz = report.nnz,
                    map_tasks = report.map_tasks,
                    attempts = report.task_attempts,
                    "merge job committed"
                );
                Ok(report)
            }
            Err(e) => {
                self.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %format!("{e:#}"), "merge job failed");
                Err(MergeError::JobFailed {
                    job: job.name.clone(),
                    output: job.output.clone(),
                    sources: job.source_count(),
                    source: e.into(),
                })
            }
        }
    }
}

fn build_pool(threads: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("resultmerge-worker-{i}"))
        .build()
        .context("build worker pool")
}

fn check_descriptor(job: &MergeJobDescriptor) -> Result<()> {
    if job.num_reducers == 0 {
        bail!("job needs at least one reducer");
    }
    if job.policy.max_attempts == 0 {
        bail!("job needs at least one attempt per task");
    }
    if job.policy.speculative_execution {
        bail!("speculative execution is not supported for merge jobs");
    }
    if job.output.file_name().is_none() {
        bail!("output {} has no file name", job.output.display());
    }
    let staging = staging_path(&job.output);
    if let Some(input) = job.inputs.iter().find(|input| {
        locations_overlap(&input.path, &job.output) || locations_overlap(&input.path, &staging)
    }) {
        bail!(
            "output {} overlaps input {}",
            job.output.display(),
            input.path.display()
        );
    }
    Ok(())
}

fn remove_location(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))
        }
        Ok(_) => fs::remove_file(path).with_context(|| format!("remove {}", path.display())),
        Err(_) => Ok(()),
    }
}

fn commit(staging: &Path, output: &Path) -> Result<()> {
    fs::remove_dir_all(staging.join(ATTEMPTS_DIR)).context("remove attempt scratch")?;
    fs::write(staging.join(SUCCESS_MARKER), b"").context("write success marker")?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::rename(staging, output)
        .with_context(|| format!("commit {} to {}", staging.display(), output.display()))
}

/// One map task's input: a data file of one source.
#[derive(Debug)]
struct MapSplit {
    path: PathBuf,
    tag: Tag,
}

struct JobContext<'a> {
    policy: &'a TaskPolicy,
    shuffle: &'a ShuffleSettings,
    injector: Option<&'a dyn FaultInjector>,
    stats: &'a RunnerStatistics,
    pool: &'a ThreadPool,
    staging: &'a Path,
}

impl JobContext<'_> {
    fn injected(&self, kind: TaskKind, task: usize, attempt: u32) -> bool {
        self.injector
            .is_some_and(|injector| injector.should_fail(kind, task, attempt))
    }

    /// Run map, shuffle and reduce. Returns the written nnz and map task count.
    fn execute<S: FormatStrategy>(
        &self,
        job: &MergeJobDescriptor,
        strategy: &S,
    ) -> Result<(u64, usize)> {
        let mut splits = Vec::new();
        for input in &job.inputs {
            for path in list_part_files(&input.path)
                .with_context(|| format!("list input {}", input.path.display()))?
            {
                splits.push(MapSplit {
                    path,
                    tag: input.tag,
                });
            }
        }
        let partitioner = RangePartitioner::new(strategy.key_space(), job.num_reducers);
        debug!(
            splits = splits.len(),
            partitions = partitioner.partitions(),
            "starting map phase"
        );

        let (tx, rx) = bounded::<MapOutputBatch<S::Key, S::Value>>(self.shuffle.channel_capacity);
        let mut partitions = std::thread::scope(|scope| -> Result<Vec<Vec<TaggedRecord<S::Key, S::Value>>>> {
            let collector =
                scope.spawn(move || collect_map_output(rx, partitioner.partitions()));
            let mapped = self.pool.install(|| {
                splits
                    .par_iter()
                    .enumerate()
                    .try_for_each_with(tx, |tx, (task, split)| {
                        self.map_task(strategy, &partitioner, task, split, tx)
                    })
            });
            let buffers = collector
                .join()
                .map_err(|_| anyhow!("shuffle collector panicked"))?;
            mapped?;
            Ok(buffers)
        })?;

        self.pool
            .install(|| partitions.par_iter_mut().for_each(|p| sort_partition(p)));
        debug!("starting reduce phase");

        let written: Vec<u64> = self.pool.install(|| {
            partitions
                .par_iter()
                .enumerate()
                .map(|(partition, records)| {
                    self.reduce_task(strategy, &partitioner, partition, records)
                })
                .collect::<Result<Vec<u64>>>()
        })?;
        Ok((written.iter().sum(), splits.len()))
    }

    fn map_task<S: FormatStrategy>(
        &self,
        strategy: &S,
        partitioner: &RangePartitioner,
        task: usize,
        split: &MapSplit,
        tx: &Sender<MapOutputBatch<S::Key, S::Value>>,
    ) -> Result<()> {
        let buffered = run_with_retries(TaskKind::Map, task, self.policy, self.stats, |attempt| {
            if self.injected(TaskKind::Map, task, attempt) {
                bail!("injected map fault");
            }
            let mut out: Vec<Vec<TaggedRecord<S::Key, S::Value>>> =
                (0..partitioner.partitions()).map(|_| Vec::new()).collect();
            let mut outside = None;
            strategy.read_split(&split.path, &mut |key, value| match strategy.position(&key) {
                Some(position) => out[partitioner.partition(position)]
                    .push(TaggedRecord::new(key, split.tag, value)),
                None => {
                    outside.get_or_insert(key);
                }
            })?;
            if let Some(key) = outside {
                bail!("key {key:?} in {} lies outside the matrix", split.path.display());
            }
            Ok(out)
        })?;

        // Attempt output becomes visible only here, after a successful attempt.
        let batch_size = self.shuffle.batch_size.max(1);
        for (partition, mut records) in buffered.into_iter().enumerate() {
            while !records.is_empty() {
                let tail = records.split_off(batch_size.min(records.len()));
                tx.send((partition, records))
                    .map_err(|_| anyhow!("shuffle channel closed"))?;
                records = tail;
            }
        }
        Ok(())
    }

    fn reduce_task<S: FormatStrategy>(
        &self,
        strategy: &S,
        partitioner: &RangePartitioner,
        partition: usize,
        records: &[TaggedRecord<S::Key, S::Value>],
    ) -> Result<u64> {
        let part = part_file_name(partition);
        run_with_retries(TaskKind::Reduce, partition, self.policy, self.stats, |attempt| {
            let scratch = self
                .staging
                .join(ATTEMPTS_DIR)
                .join(format!("{part}.attempt-{attempt}"));
            let attempted =
                self.reduce_attempt(strategy, partitioner, partition, attempt, records, &scratch);
            if attempted.is_err() {
                let _ = fs::remove_file(&scratch);
            }
            attempted
        })
    }

    fn reduce_attempt<S: FormatStrategy>(
        &self,
        strategy: &S,
        partitioner: &RangePartitioner,
        partition: usize,
        attempt: u32,
        records: &[TaggedRecord<S::Key, S::Value>],
        scratch: &Path,
    ) -> Result<u64> {
        let nnz = strategy.reduce(partitioner.range(partition), group_by_key(records), scratch)?;
        if self.injected(TaskKind::Reduce, partition, attempt) {
            bail!("injected reduce fault");
        }
        fs::rename(scratch, self.staging.join(part_file_name(partition)))
            .with_context(|| format!("promote {}", scratch.display()))?;
        Ok(nnz)
    }
}
