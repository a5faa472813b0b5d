//! Generators for merge inputs used by tests and benchmarks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::matrix::{InMemoryMatrix, MatrixObject};
use crate::model::{CellIndex, MatrixCharacteristics, MatrixFormat};

/// A baseline, the writes of each partial, and the expected merge result.
#[derive(Debug, Clone)]
pub struct GeneratedMerge {
    pub shape: MatrixCharacteristics,
    pub baseline: BTreeMap<CellIndex, f64>,
    pub writes: Vec<BTreeMap<CellIndex, f64>>,
    pub expected: BTreeMap<CellIndex, f64>,
}

impl GeneratedMerge {
    /// Non-zero count of the expected result.
    pub fn expected_nnz(&self) -> u64 {
        self.expected.len() as u64
    }

    /// Build in-memory matrices for this case under `dir`. Each partial is the
    /// baseline with its own writes applied.
    pub fn materialize(
        &self,
        dir: &Path,
        format: MatrixFormat,
    ) -> Result<(Arc<dyn MatrixObject>, Vec<Option<Arc<dyn MatrixObject>>>)> {
        let baseline = InMemoryMatrix::from_cells(
            "B",
            dir.join("B"),
            format,
            self.shape,
            self.baseline.iter().map(|(k, v)| (*k, *v)),
        )?;
        let mut partials = Vec::with_capacity(self.writes.len());
        for (i, writes) in self.writes.iter().enumerate() {
            let name = format!("P{i}");
            let partial = baseline.with_updates(
                name.clone(),
                dir.join(name),
                writes.iter().map(|(k, v)| (*k, *v)),
            )?;
            partials.push(Some(Arc::new(partial) as Arc<dyn MatrixObject>));
        }
        let baseline: Arc<dyn MatrixObject> = Arc::new(baseline);
        Ok((baseline, partials))
    }
}

/// Random sparse cells with roughly `density` of the shape non-zero.
pub fn generate_sparse_cells(
    shape: &MatrixCharacteristics,
    density: f64,
    seed: u64,
) -> BTreeMap<CellIndex, f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut cells = BTreeMap::new();
    for row in 1..=shape.rows {
        for col in 1..=shape.cols {
            if rng.random_bool(density) {
                cells.insert(CellIndex::new(row, col), rng.random_range(1..1000) as f64);
            }
        }
    }
    cells
}

/// A merge case where each partial writes `writes_per_partial` cells and no
/// two partials write the same cell. Written values are non-zero and differ
/// from the baseline.
pub fn generate_merge_case(
    shape: MatrixCharacteristics,
    density: f64,
    partials: usize,
    writes_per_partial: usize,
    seed: u64,
) -> GeneratedMerge {
    let baseline = generate_sparse_cells(&shape, density, seed);
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));

    let mut coordinates: Vec<CellIndex> = (0..shape.num_cells())
        .map(|position| shape.cell_at(position))
        .collect();
    coordinates.shuffle(&mut rng);

    let mut expected = baseline.clone();
    let mut writes = Vec::with_capacity(partials);
    let mut remaining = coordinates.into_iter();
    for _ in 0..partials {
        let mut partial = BTreeMap::new();
        for index in remaining.by_ref().take(writes_per_partial) {
            let old = baseline.get(&index).copied().unwrap_or(0.0);
            let value = old + rng.random_range(1..100) as f64;
            partial.insert(index, value);
            expected.insert(index, value);
        }
        writes.push(partial);
    }

    GeneratedMerge {
        shape,
        baseline,
        writes,
        expected,
    }
}
