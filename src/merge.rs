//! # Merge Coordinator
//!
//! Public entry point of a result merge. The coordinator validates the
//! baseline and partials, decides whether a job is needed at all, makes the
//! inputs durable, sizes and submits the merge job, and wraps the job output
//! in a fresh [`MatrixHandle`].
//!
//! The coordinator holds no per-call state and can be shared by nested
//! parallel loops.

use crate::config::{MergeConfig, JOB_NAME_PREFIX, MERGED_NAME_SUFFIX};
use crate::error::MergeError;
use crate::formats::locations_overlap;
use crate::job::{JobRunner, LocalJobRunner, MergeInput, MergeJobDescriptor, TaskPolicy};
use crate::matrix::{MatrixHandle, MatrixObject};
use crate::model::{MatrixCharacteristics, MatrixFormat};
use crate::tagged::Tag;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Number of reduce tasks for an output: the estimated number of output
/// groups, capped by `cap`, and never less than one.
///
/// Block outputs have one group per block; cell outputs one per
/// `cell_budget` cells.
pub fn reducer_count(
    format: MatrixFormat,
    mc: &MatrixCharacteristics,
    cap: usize,
    cell_budget: u64,
) -> usize {
    let groups = match format {
        MatrixFormat::BinaryBlock => mc.num_blocks(),
        MatrixFormat::TextCell | MatrixFormat::BinaryCell => {
            mc.num_cells().div_ceil(u128::from(cell_budget.max(1)))
        }
    };
    groups.min(cap.max(1) as u128).max(1) as usize
}

/// Logical name of a merged output, distinct from the baseline's.
pub fn merged_name(baseline: &str) -> String {
    if baseline.ends_with(MERGED_NAME_SUFFIX) {
        baseline.to_string()
    } else {
        format!("{baseline}{MERGED_NAME_SUFFIX}")
    }
}

/// Reconciles the partial outputs of a parallel loop with its baseline.
pub struct MergeCoordinator {
    config: MergeConfig,
    runner: Arc<dyn JobRunner>,
}

impl MergeCoordinator {
    pub fn new(config: MergeConfig, runner: Arc<dyn JobRunner>) -> Self {
        Self { config, runner }
    }

    /// Coordinator backed by an in-process [`LocalJobRunner`].
    pub fn local(config: MergeConfig) -> Self {
        let runner = Arc::new(LocalJobRunner::from_config(&config));
        Self::new(config, runner)
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merge `partials` into a new matrix stored at `output`.
    ///
    /// Absent partials and partials stored at the baseline's own location are
    /// ignored. With nothing left to merge the baseline itself is returned
    /// and no job runs. Otherwise the result is a new handle named after the
    /// baseline; inputs are never modified.
    pub fn merge(
        &self,
        baseline: &Arc<dyn MatrixObject>,
        partials: &[Option<Arc<dyn MatrixObject>>],
        output: &Path,
        job_id: u64,
    ) -> Result<Arc<dyn MatrixObject>, MergeError> {
        self.merge_with_parallelism(baseline, partials, output, job_id, self.config.job.mappers)
    }

    /// Like [`Self::merge`], with the mapper hint overridden for this call.
    #[instrument(
        skip(self, baseline, partials, output),
        fields(baseline = baseline.var_name(), output = %output.display())
    )]
    pub fn merge_with_parallelism(
        &self,
        baseline: &Arc<dyn MatrixObject>,
        partials: &[Option<Arc<dyn MatrixObject>>],
        output: &Path,
        job_id: u64,
        parallelism: usize,
    ) -> Result<Arc<dyn MatrixObject>, MergeError> {
        let inputs: Vec<&Arc<dyn MatrixObject>> = partials
            .iter()
            .flatten()
            .filter(|partial| partial.file_name() != baseline.file_name())
            .collect();
        if inputs.is_empty() {
            debug!("no partials to merge, keeping baseline");
            return Ok(Arc::clone(baseline));
        }

        let mc = baseline.characteristics();
        let format = baseline.format();
        self.check_inputs(&**baseline, &inputs, output)?;

        for partial in &inputs {
            partial.export_data()?;
        }
        let with_compare = mc.nnz > 0;
        if with_compare {
            baseline.export_data()?;
        } else if format.is_cell() {
            info!(
                partials = inputs.len(),
                "merging {format} partials without compare; a local merge would be cheaper"
            );
        }

        let mut sources = Vec::with_capacity(inputs.len() + 1);
        if with_compare {
            sources.push(MergeInput {
                path: baseline.file_name().to_path_buf(),
                tag: Tag::Compare,
            });
        }
        for (source, partial) in inputs.iter().enumerate() {
            let source = u32::try_from(source)
                .map_err(|_| MergeError::config("too many partials for one merge"))?;
            sources.push(MergeInput {
                path: partial.file_name().to_path_buf(),
                tag: Tag::data(source),
            });
        }

        let settings = &self.config.job;
        let job = MergeJobDescriptor {
            name: format!("{JOB_NAME_PREFIX}{job_id}"),
            inputs: sources,
            output: output.to_path_buf(),
            format,
            characteristics: mc.with_nnz(0),
            num_mappers: parallelism.max(1),
            num_reducers: reducer_count(
                format,
                &mc,
                settings.reducer_cap,
                settings.cell_buffer_size,
            ),
            policy: TaskPolicy::for_result_merge(settings),
        };
        debug!(
            job = %job.name,
            sources = job.source_count(),
            reducers = job.num_reducers,
            with_compare,
            "submitting merge job"
        );
        let report = self.runner.submit(&job)?;

        let merged = MatrixHandle::new(
            merged_name(baseline.var_name()),
            output,
            format,
            mc.with_nnz(report.nnz),
        );
        if let Err(e) = merged.persist_metadata() {
            if let Err(cleanup) = fs::remove_dir_all(output) {
                error!(error = %cleanup, "failed to remove output without metadata");
            }
            return Err(e);
        }
        info!(job = %job.name, nnz = report.nnz, "merged {} partials", inputs.len());
        Ok(Arc::new(merged))
    }

    fn check_inputs(
        &self,
        baseline: &dyn MatrixObject,
        partials: &[&Arc<dyn MatrixObject>],
        output: &Path,
    ) -> Result<(), MergeError> {
        let mc = baseline.characteristics();
        mc.validate()?;
        if locations_overlap(output, baseline.file_name()) {
            return Err(MergeError::config(format!(
                "output {} overlaps the baseline's location {}",
                output.display(),
                baseline.file_name().display()
            )));
        }
        for partial in partials {
            if locations_overlap(output, partial.file_name()) {
                return Err(MergeError::config(format!(
                    "output {} overlaps the location of partial `{}`",
                    output.display(),
                    partial.var_name()
                )));
            }
            if partial.format() != baseline.format() {
                return Err(MergeError::config(format!(
                    "partial `{}` is {}, baseline is {}",
                    partial.var_name(),
                    partial.format(),
                    baseline.format()
                )));
            }
            let shape = partial.characteristics();
            if !shape.same_shape(&mc) {
                return Err(MergeError::config(format!(
                    "partial `{}` is {}x{} in {}x{} blocks, baseline is {}x{} in {}x{} blocks",
                    partial.var_name(),
                    shape.rows,
                    shape.cols,
                    shape.rows_per_block,
                    shape.cols_per_block,
                    mc.rows,
                    mc.cols,
                    mc.rows_per_block,
                    mc.cols_per_block
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobReport;
    use crate::matrix::InMemoryMatrix;
    use crate::model::CellIndex;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    /// Records submitted jobs and reports a fixed nnz without running them.
    #[derive(Default)]
    struct RecordingRunner {
        jobs: Mutex<Vec<MergeJobDescriptor>>,
    }

    impl JobRunner for RecordingRunner {
        fn submit(&self, job: &MergeJobDescriptor) -> Result<JobReport, MergeError> {
            self.jobs.lock().push(job.clone());
            Ok(JobReport {
                nnz: 42,
                map_tasks: job.inputs.len(),
                reduce_tasks: job.num_reducers,
                task_attempts: 0,
                failed_attempts: 0,
                replication: job.policy.replication,
            })
        }
    }

    fn coordinator() -> (MergeCoordinator, Arc<RecordingRunner>) {
        let runner = Arc::new(RecordingRunner::default());
        let config = MergeConfig::default();
        (MergeCoordinator::new(config, runner.clone()), runner)
    }

    fn matrix(
        dir: &Path,
        name: &str,
        mc: MatrixCharacteristics,
        cells: &[(u64, u64, f64)],
    ) -> Arc<dyn MatrixObject> {
        let cells = cells.iter().map(|&(r, c, v)| (CellIndex::new(r, c), v));
        Arc::new(
            InMemoryMatrix::from_cells(name, dir.join(name), MatrixFormat::TextCell, mc, cells)
                .unwrap(),
        )
    }

    #[test]
    fn test_reducer_count_caps_to_block_count() {
        let mc = MatrixCharacteristics::new(4, 4, 2, 2);
        assert_eq!(reducer_count(MatrixFormat::BinaryBlock, &mc, 1000, 1), 4);
        assert_eq!(reducer_count(MatrixFormat::BinaryBlock, &mc, 3, 1), 3);
    }

    #[test]
    fn test_reducer_count_for_cells() {
        let mc = MatrixCharacteristics::new(100, 10, 10, 10);
        assert_eq!(reducer_count(MatrixFormat::TextCell, &mc, 64, 300), 4);
        assert_eq!(reducer_count(MatrixFormat::BinaryCell, &mc, 64, 1_000_000), 1);
        assert_eq!(reducer_count(MatrixFormat::BinaryCell, &mc, 2, 1), 2);
        assert_eq!(reducer_count(MatrixFormat::TextCell, &mc, 0, 0), 1);
    }

    #[test]
    fn test_merged_name_suffix() {
        assert_eq!(merged_name("R"), "R_rm");
        assert_eq!(merged_name("R_rm"), "R_rm");
    }

    #[test]
    fn test_no_partials_returns_baseline() {
        let dir = tempdir().unwrap();
        let (coordinator, runner) = coordinator();
        let mc = MatrixCharacteristics::new(2, 2, 2, 2);
        let baseline = matrix(dir.path(), "B", mc, &[(1, 1, 1.0)]);
        let same = baseline.clone();
        let partials = vec![None, Some(same)];
        let merged = coordinator
            .merge(&baseline, &partials, &dir.path().join("out"), 1)
            .unwrap();
        assert!(Arc::ptr_eq(&merged, &baseline));
        assert!(runner.jobs.lock().is_empty());
    }

    #[test]
    fn test_descriptor_with_compare() {
        let dir = tempdir().unwrap();
        let (coordinator, runner) = coordinator();
        let mc = MatrixCharacteristics::new(3, 3, 2, 2);
        let baseline = matrix(dir.path(), "B", mc, &[(1, 1, 1.0)]);
        let p0 = matrix(dir.path(), "P0", mc, &[(1, 1, 1.0), (2, 2, 3.0)]);
        let p1 = matrix(dir.path(), "P1", mc, &[(1, 1, 1.0), (3, 3, 4.0)]);
        let output = dir.path().join("out");
        let merged = coordinator
            .merge(&baseline, &[Some(p0.clone()), None, Some(p1.clone())], &output, 7)
            .unwrap();

        let jobs = runner.jobs.lock();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.name, "ResultMerge-7");
        assert!(job.with_compare());
        let tags: Vec<Tag> = job.inputs.iter().map(|i| i.tag).collect();
        assert_eq!(tags, vec![Tag::Compare, Tag::data(0), Tag::data(1)]);
        assert_eq!(job.inputs[2].path, p1.file_name());
        assert_eq!(job.policy.task_timeout, None);
        assert!(!job.policy.speculative_execution);

        assert_eq!(merged.var_name(), "B_rm");
        assert_eq!(merged.file_name(), output.as_path());
        assert_eq!(merged.characteristics().nnz, 42);
        assert!(dir.path().join("B").exists());
        assert!(dir.path().join("out.mtd").exists());
    }

    #[test]
    fn test_zero_baseline_runs_without_compare() {
        let dir = tempdir().unwrap();
        let (coordinator, runner) = coordinator();
        let mc = MatrixCharacteristics::new(3, 3, 2, 2);
        let baseline = matrix(dir.path(), "B", mc, &[]);
        let p0 = matrix(dir.path(), "P0", mc, &[(1, 1, 5.0)]);
        coordinator
            .merge_with_parallelism(&baseline, &[Some(p0)], &dir.path().join("out"), 1, 3)
            .unwrap();
        let jobs = runner.jobs.lock();
        assert!(!jobs[0].with_compare());
        assert_eq!(jobs[0].num_mappers, 3);
        assert!(!dir.path().join("B").exists());
    }

    #[test]
    fn test_output_aliasing_input_rejected() {
        let dir = tempdir().unwrap();
        let (coordinator, runner) = coordinator();
        let mc = MatrixCharacteristics::new(2, 2, 2, 2);
        let baseline = matrix(dir.path(), "B", mc, &[(1, 1, 1.0)]);
        let p0 = matrix(dir.path(), "P0", mc, &[(1, 1, 2.0)]);
        let err = coordinator
            .merge(&baseline, &[Some(p0.clone())], p0.file_name(), 1)
            .unwrap_err();
        assert!(matches!(err, MergeError::Config(_)));
        let err = coordinator
            .merge(&baseline, &[Some(p0)], &dir.path().join("B"), 1)
            .unwrap_err();
        assert!(matches!(err, MergeError::Config(_)));
        assert!(runner.jobs.lock().is_empty());
    }

    #[test]
    fn test_output_enclosing_or_inside_input_rejected() {
        let dir = tempdir().unwrap();
        let (coordinator, runner) = coordinator();
        let mc = MatrixCharacteristics::new(2, 2, 2, 2);
        let work = dir.path().join("work");
        let baseline = matrix(&work, "B", mc, &[(1, 1, 1.0)]);
        let p0 = matrix(&work, "P0", mc, &[(1, 1, 2.0)]);
        for output in [work.clone(), work.join("P0").join("nested"), dir.path().to_path_buf()] {
            let err = coordinator
                .merge(&baseline, &[Some(p0.clone())], &output, 1)
                .unwrap_err();
            assert!(matches!(err, MergeError::Config(_)), "{}", output.display());
        }
        assert!(runner.jobs.lock().is_empty());
        coordinator
            .merge(&baseline, &[Some(p0)], &dir.path().join("work-out"), 2)
            .unwrap();
    }

    /// Commits an output directory, then lets metadata writing fail.
    struct CommittingRunner;

    impl JobRunner for CommittingRunner {
        fn submit(&self, job: &MergeJobDescriptor) -> Result<JobReport, MergeError> {
            std::fs::create_dir_all(job.output.join("part-00000")).unwrap();
            std::fs::create_dir_all(crate::matrix::metadata_path(&job.output)).unwrap();
            Ok(JobReport {
                nnz: 1,
                map_tasks: 1,
                reduce_tasks: 1,
                task_attempts: 2,
                failed_attempts: 0,
                replication: 1,
            })
        }
    }

    #[test]
    fn test_metadata_failure_removes_committed_output() {
        let dir = tempdir().unwrap();
        let coordinator = MergeCoordinator::new(MergeConfig::default(), Arc::new(CommittingRunner));
        let mc = MatrixCharacteristics::new(2, 2, 2, 2);
        let baseline = matrix(dir.path(), "B", mc, &[(1, 1, 1.0)]);
        let p0 = matrix(dir.path(), "P0", mc, &[(1, 1, 2.0)]);
        let output = dir.path().join("out");
        let err = coordinator
            .merge(&baseline, &[Some(p0)], &output, 1)
            .unwrap_err();
        assert!(matches!(err, MergeError::Durability { .. }));
        assert!(!output.exists());
    }

    #[test]
    fn test_shape_and_format_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let (coordinator, _runner) = coordinator();
        let mc = MatrixCharacteristics::new(2, 2, 2, 2);
        let baseline = matrix(dir.path(), "B", mc, &[(1, 1, 1.0)]);
        let wide = matrix(dir.path(), "P0", MatrixCharacteristics::new(2, 3, 2, 2), &[]);
        let err = coordinator
            .merge(&baseline, &[Some(wide)], &dir.path().join("out"), 1)
            .unwrap_err();
        assert!(matches!(err, MergeError::Config(_)));

        let binary: Arc<dyn MatrixObject> = Arc::new(MatrixHandle::new(
            "P1",
            dir.path().join("P1"),
            MatrixFormat::BinaryBlock,
            mc,
        ));
        let err = coordinator
            .merge(&baseline, &[Some(binary)], &dir.path().join("out"), 1)
            .unwrap_err();
        assert!(matches!(err, MergeError::Config(_)));
    }

    #[test]
    fn test_export_failure_aborts_before_submit() {
        let dir = tempdir().unwrap();
        let (coordinator, runner) = coordinator();
        let mc = MatrixCharacteristics::new(2, 2, 2, 2);
        let baseline = matrix(dir.path(), "B", mc, &[(1, 1, 1.0)]);
        let missing: Arc<dyn MatrixObject> = Arc::new(MatrixHandle::new(
            "P0",
            dir.path().join("never-written"),
            MatrixFormat::TextCell,
            mc,
        ));
        let err = coordinator
            .merge(&baseline, &[Some(missing)], &dir.path().join("out"), 1)
            .unwrap_err();
        assert!(matches!(err, MergeError::Durability { .. }));
        assert!(runner.jobs.lock().is_empty());
    }
}
