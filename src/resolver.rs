//! # Conflict Resolver
//!
//! Decides the winning value for one key given its tagged candidates.
//!
//! Every partial is a full copy of the loop output, so a partial "wrote" a
//! key exactly when its value differs from the baseline value there. The
//! rule applied to each key (cell, or each cell of a block):
//!
//! - the baseline value is the `Compare` value, or zero when there is none;
//! - the winner is the first `Data` value, by ascending source index, that
//!   differs from the baseline value;
//! - with no differing `Data` value, the baseline value stands.
//!
//! Multiple differing `Data` values are a write-write conflict. The lowest
//! source index wins; the loop construct is expected never to produce them.

use crate::model::MatrixBlock;
use crate::tagged::Tag;
use anyhow::{ensure, Result};

/// Streaming resolver for one cell key.
///
/// Feed records in shuffle order (`Compare` first, then `Data` by source).
#[derive(Debug, Default)]
pub struct CellResolver {
    compare: Option<f64>,
    winner: Option<f64>,
    seen: bool,
    last_tag: Option<Tag>,
}

impl CellResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, tag: Tag, value: f64) {
        debug_assert!(
            self.last_tag.map_or(true, |last| last <= tag),
            "records for a key must arrive in shuffle order"
        );
        self.last_tag = Some(tag);
        self.seen = true;
        match tag {
            Tag::Compare => {
                if self.compare.is_none() {
                    self.compare = Some(value);
                }
            }
            Tag::Data { .. } => {
                let baseline = self.compare.unwrap_or(0.0);
                if self.winner.is_none() && value != baseline {
                    self.winner = Some(value);
                }
            }
        }
    }

    /// Winning value, or `None` if no record was observed at all.
    pub fn finish(self) -> Option<f64> {
        if !self.seen {
            return None;
        }
        Some(self.winner.or(self.compare).unwrap_or(0.0))
    }
}

/// Resolve one key's batch of `(tag, value)` candidates.
pub fn resolve_cell<I>(records: I) -> Option<f64>
where
    I: IntoIterator<Item = (Tag, f64)>,
{
    let mut resolver = CellResolver::new();
    for (tag, value) in records {
        resolver.observe(tag, value);
    }
    resolver.finish()
}

/// Block-sized elementwise merge for one block key.
///
/// The first record may be the `Compare` block; every later one is a `Data`
/// block merged cell by cell against the baseline.
#[derive(Debug)]
pub struct BlockMerger {
    rows: u32,
    cols: u32,
    baseline: Vec<f64>,
    out: Vec<f64>,
    written: Vec<bool>,
    scratch: Vec<f64>,
    has_data: bool,
}

impl BlockMerger {
    /// Merger for a block of the given extent, with an all-zero baseline.
    pub fn new(rows: u32, cols: u32) -> Self {
        let len = rows as usize * cols as usize;
        Self {
            rows,
            cols,
            baseline: vec![0.0; len],
            out: vec![0.0; len],
            written: vec![false; len],
            scratch: vec![0.0; len],
            has_data: false,
        }
    }

    fn check_dims(&self, block: &MatrixBlock) -> Result<()> {
        ensure!(
            block.rows() == self.rows && block.cols() == self.cols,
            "block is {}x{}, expected {}x{}",
            block.rows(),
            block.cols(),
            self.rows,
            self.cols
        );
        Ok(())
    }

    /// Install the baseline block. Must precede every data block.
    pub fn set_compare(&mut self, block: &MatrixBlock) -> Result<()> {
        self.check_dims(block)?;
        ensure!(!self.has_data, "compare block arrived after data blocks");
        block.fill_dense(&mut self.baseline);
        self.out.copy_from_slice(&self.baseline);
        Ok(())
    }

    /// Merge one partial's block; cells already taken by a lower source are kept.
    pub fn merge_data(&mut self, block: &MatrixBlock) -> Result<()> {
        self.check_dims(block)?;
        self.has_data = true;
        block.fill_dense(&mut self.scratch);
        for (i, value) in self.scratch.iter().enumerate() {
            if !self.written[i] && *value != self.baseline[i] {
                self.out[i] = *value;
                self.written[i] = true;
            }
        }
        Ok(())
    }

    pub fn observe(&mut self, tag: Tag, block: &MatrixBlock) -> Result<()> {
        match tag {
            Tag::Compare => self.set_compare(block),
            Tag::Data { .. } => self.merge_data(block),
        }
    }

    pub fn finish(self) -> Result<MatrixBlock> {
        MatrixBlock::from_dense_values(self.rows, self.cols, self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_compare_keeps_baseline() {
        assert_eq!(resolve_cell([(Tag::Compare, 4.0)]), Some(4.0));
    }

    #[test]
    fn test_single_data_without_compare_wins() {
        assert_eq!(resolve_cell([(Tag::data(2), 5.0)]), Some(5.0));
    }

    #[test]
    fn test_data_overwrites_compare() {
        assert_eq!(resolve_cell([(Tag::Compare, 1.0), (Tag::data(0), 9.0)]), Some(9.0));
    }

    #[test]
    fn test_unchanged_copies_do_not_mask_a_write() {
        // Partial 0 carries the baseline value, partial 1 wrote the key.
        let winner = resolve_cell([
            (Tag::Compare, 3.0),
            (Tag::data(0), 3.0),
            (Tag::data(1), 8.0),
        ]);
        assert_eq!(winner, Some(8.0));
    }

    #[test]
    fn test_write_write_conflict_prefers_lowest_source() {
        let winner = resolve_cell([(Tag::data(0), 2.0), (Tag::data(1), 6.0)]);
        assert_eq!(winner, Some(2.0));
        let winner = resolve_cell([(Tag::Compare, 1.0), (Tag::data(3), 7.0), (Tag::data(5), 6.0)]);
        assert_eq!(winner, Some(7.0));
    }

    #[test]
    fn test_no_records_resolves_to_none() {
        assert_eq!(resolve_cell(std::iter::empty::<(Tag, f64)>()), None);
    }

    #[test]
    fn test_zero_write_over_baseline() {
        assert_eq!(resolve_cell([(Tag::Compare, 5.0), (Tag::data(0), 0.0)]), Some(0.0));
    }

    #[test]
    fn test_block_merge_disjoint_writes() {
        let compare = MatrixBlock::dense(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let p0 = MatrixBlock::dense(2, 2, vec![1.0, 9.0, 0.0, 1.0]).unwrap();
        let p1 = MatrixBlock::sparse(2, 2, vec![(0, 0, 1.0), (1, 0, 7.0), (1, 1, 1.0)]).unwrap();

        let mut merger = BlockMerger::new(2, 2);
        merger.observe(Tag::Compare, &compare).unwrap();
        merger.observe(Tag::data(0), &p0).unwrap();
        merger.observe(Tag::data(1), &p1).unwrap();
        let merged = merger.finish().unwrap();
        assert_eq!(merged.to_dense_values(), vec![1.0, 9.0, 7.0, 1.0]);
    }

    #[test]
    fn test_block_merge_zero_write_and_conflict() {
        let compare = MatrixBlock::dense(1, 3, vec![5.0, 5.0, 5.0]).unwrap();
        let p0 = MatrixBlock::dense(1, 3, vec![0.0, 5.0, 2.0]).unwrap();
        let p1 = MatrixBlock::dense(1, 3, vec![5.0, 5.0, 3.0]).unwrap();

        let mut merger = BlockMerger::new(1, 3);
        merger.set_compare(&compare).unwrap();
        merger.merge_data(&p0).unwrap();
        merger.merge_data(&p1).unwrap();
        let merged = merger.finish().unwrap();
        assert_eq!(merged.to_dense_values(), vec![0.0, 5.0, 2.0]);
        assert_eq!(merged.nnz(), 2);
    }

    #[test]
    fn test_block_merge_without_compare_is_union() {
        let p0 = MatrixBlock::sparse(2, 2, vec![(0, 0, 4.0)]).unwrap();
        let p1 = MatrixBlock::sparse(2, 2, vec![(1, 1, 6.0)]).unwrap();
        let mut merger = BlockMerger::new(2, 2);
        merger.merge_data(&p0).unwrap();
        merger.merge_data(&p1).unwrap();
        let merged = merger.finish().unwrap();
        assert_eq!(merged.nonzeros(), vec![(0, 0, 4.0), (1, 1, 6.0)]);
    }

    #[test]
    fn test_block_merge_rejects_mismatched_extent() {
        let mut merger = BlockMerger::new(2, 2);
        let wrong = MatrixBlock::zeros(3, 2);
        assert!(merger.merge_data(&wrong).is_err());
    }
}
