use std::collections::BTreeMap;
use std::sync::Arc;

use resultmerge::formats::read_matrix;
use resultmerge::{
    CellIndex, FaultInjector, JobSettings, LocalJobRunner, MatrixObject, MergeConfig,
    MergeCoordinator, ShuffleSettings,
};

/// Small pools and batches so tiny matrices still spread over several tasks.
#[allow(dead_code)]
pub fn test_config(reducer_cap: usize, max_task_attempts: u32) -> MergeConfig {
    MergeConfig {
        job: JobSettings {
            mappers: 2,
            reducer_cap,
            max_task_attempts,
            worker_reuse: false,
            cell_buffer_size: 4,
            ..JobSettings::default()
        },
        shuffle: ShuffleSettings {
            channel_capacity: 4,
            batch_size: 8,
        },
    }
}

/// Coordinator and its runner, with an optional fault injector.
#[allow(dead_code)]
pub fn local_coordinator(
    config: MergeConfig,
    injector: Option<Arc<dyn FaultInjector>>,
) -> (MergeCoordinator, Arc<LocalJobRunner>) {
    let mut runner = LocalJobRunner::from_config(&config);
    if let Some(injector) = injector {
        runner = runner.with_fault_injector(injector);
    }
    let runner = Arc::new(runner);
    (MergeCoordinator::new(config, runner.clone()), runner)
}

/// Non-zero cells stored at a matrix's location.
#[allow(dead_code)]
pub fn read_cells(matrix: &dyn MatrixObject) -> anyhow::Result<BTreeMap<CellIndex, f64>> {
    read_matrix(
        matrix.file_name(),
        matrix.format(),
        &matrix.characteristics(),
    )
}

#[allow(dead_code)]
pub fn cells(entries: &[(u64, u64, f64)]) -> BTreeMap<CellIndex, f64> {
    entries
        .iter()
        .map(|&(row, col, value)| (CellIndex::new(row, col), value))
        .collect()
}
