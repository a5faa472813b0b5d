mod support;

use std::sync::Arc;

use resultmerge::formats::list_part_files;
use resultmerge::{
    reducer_count, CellIndex, InMemoryMatrix, MatrixCharacteristics, MatrixFormat, MatrixHandle,
    MatrixObject,
};
use support::{cells, local_coordinator, read_cells, test_config};
use tempfile::tempdir;

const FORMATS: [MatrixFormat; 3] = [
    MatrixFormat::TextCell,
    MatrixFormat::BinaryCell,
    MatrixFormat::BinaryBlock,
];

fn in_memory(
    dir: &std::path::Path,
    name: &str,
    format: MatrixFormat,
    shape: MatrixCharacteristics,
    values: &[f64],
) -> anyhow::Result<InMemoryMatrix> {
    InMemoryMatrix::from_dense(name, dir.join(name), format, shape, values)
}

#[test]
fn single_write_into_zero_matrix() -> anyhow::Result<()> {
    for format in FORMATS {
        let dir = tempdir()?;
        let shape = MatrixCharacteristics::new(3, 3, 2, 2);
        let baseline = in_memory(dir.path(), "B", format, shape, &[0.0; 9])?;
        let partial = baseline.with_updates("P0", dir.path().join("P0"), cells(&[(1, 1, 5.0)]))?;
        let baseline: Arc<dyn MatrixObject> = Arc::new(baseline);
        let partial: Arc<dyn MatrixObject> = Arc::new(partial);

        let (coordinator, _runner) = local_coordinator(test_config(8, 2), None);
        let merged = coordinator.merge(&baseline, &[Some(partial)], &dir.path().join("out"), 1)?;

        assert_eq!(merged.characteristics().nnz, 1, "{format}");
        assert!(merged.characteristics().same_shape(&shape));
        assert_eq!(read_cells(&*merged)?, cells(&[(1, 1, 5.0)]), "{format}");
    }
    Ok(())
}

#[test]
fn disjoint_writes_into_identity() -> anyhow::Result<()> {
    for format in FORMATS {
        let dir = tempdir()?;
        let shape = MatrixCharacteristics::new(2, 2, 1, 2);
        let baseline = in_memory(dir.path(), "B", format, shape, &[1.0, 0.0, 0.0, 1.0])?;
        let p1 = baseline.with_updates("P1", dir.path().join("P1"), cells(&[(1, 2, 9.0)]))?;
        let p2 = baseline.with_updates("P2", dir.path().join("P2"), cells(&[(2, 1, 7.0)]))?;
        let baseline: Arc<dyn MatrixObject> = Arc::new(baseline);
        let p1: Arc<dyn MatrixObject> = Arc::new(p1);
        let p2: Arc<dyn MatrixObject> = Arc::new(p2);
        let partials = vec![Some(p1), Some(p2)];

        let (coordinator, _runner) = local_coordinator(test_config(8, 2), None);
        let merged = coordinator.merge(&baseline, &partials, &dir.path().join("out"), 2)?;

        assert_eq!(
            read_cells(&*merged)?,
            cells(&[(1, 1, 1.0), (1, 2, 9.0), (2, 1, 7.0), (2, 2, 1.0)]),
            "{format}"
        );
        assert_eq!(merged.characteristics().nnz, 4);
        assert_eq!(merged.var_name(), "B_rm");
    }
    Ok(())
}

#[test]
fn zero_partials_return_the_baseline() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let shape = MatrixCharacteristics::new(2, 2, 2, 2);
    let baseline: Arc<dyn MatrixObject> = Arc::new(in_memory(
        dir.path(),
        "B",
        MatrixFormat::TextCell,
        shape,
        &[1.0, 2.0, 0.0, 3.0],
    )?);

    let (coordinator, runner) = local_coordinator(test_config(8, 2), None);
    let merged = coordinator.merge(&baseline, &[], &dir.path().join("out"), 3)?;
    let absent = coordinator.merge(&baseline, &[None, None], &dir.path().join("out"), 4)?;

    assert_eq!(merged.file_name(), baseline.file_name());
    assert_eq!(merged.characteristics(), baseline.characteristics());
    assert_eq!(absent.file_name(), baseline.file_name());
    assert_eq!(runner.statistics().snapshot().jobs_submitted, 0);
    assert!(!dir.path().join("out").exists());
    Ok(())
}

#[test]
fn reducer_request_caps_to_block_count() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let shape = MatrixCharacteristics::new(4, 4, 2, 2);
    assert_eq!(reducer_count(MatrixFormat::BinaryBlock, &shape, 1000, 1), 4);

    let values: Vec<f64> = (1..=16).map(f64::from).collect();
    let baseline = in_memory(dir.path(), "B", MatrixFormat::BinaryBlock, shape, &values)?;
    let partial = baseline.with_updates("P0", dir.path().join("P0"), cells(&[(4, 4, 0.5)]))?;
    let baseline: Arc<dyn MatrixObject> = Arc::new(baseline);
    let partial: Arc<dyn MatrixObject> = Arc::new(partial);

    let (coordinator, _runner) = local_coordinator(test_config(1000, 2), None);
    let merged = coordinator.merge(&baseline, &[Some(partial)], &dir.path().join("out"), 5)?;

    assert_eq!(list_part_files(merged.file_name())?.len(), 4);
    assert_eq!(merged.characteristics().nnz, 16);
    let merged_cells = read_cells(&*merged)?;
    assert_eq!(merged_cells.get(&CellIndex::new(4, 4)), Some(&0.5));
    Ok(())
}

#[test]
fn merged_output_reopens_from_metadata() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let shape = MatrixCharacteristics::new(3, 2, 2, 2);
    let baseline = in_memory(
        dir.path(),
        "R",
        MatrixFormat::BinaryCell,
        shape,
        &[1.0, 0.0, 0.0, 2.0, 0.0, 0.0],
    )?;
    let partial = baseline.with_updates("P0", dir.path().join("P0"), cells(&[(3, 1, 4.0)]))?;
    let baseline: Arc<dyn MatrixObject> = Arc::new(baseline);
    let partial: Arc<dyn MatrixObject> = Arc::new(partial);

    let (coordinator, _runner) = local_coordinator(test_config(8, 2), None);
    let out = dir.path().join("R_out");
    let merged = coordinator.merge(&baseline, &[Some(partial)], &out, 6)?;

    let reopened = MatrixHandle::open(&out)?;
    assert_eq!(reopened.var_name(), "R_rm");
    assert_eq!(reopened.format(), MatrixFormat::BinaryCell);
    assert_eq!(reopened.characteristics(), merged.characteristics());
    assert_eq!(reopened.characteristics().nnz, 3);
    Ok(())
}
