//! # Format Strategies
//!
//! Each physical encoding supplies its key scheme, its position in the
//! range-partitioned key space, and the reducer that turns one partition's
//! grouped records into an output part file.

use crate::formats::{self, BinaryBlockWriter, BinaryCellWriter, TextCellWriter};
use crate::model::{BlockIndex, CellIndex, MatrixBlock, MatrixCharacteristics, MatrixFormat};
use crate::resolver::{BlockMerger, CellResolver};
use crate::tagged::TaggedRecord;
use anyhow::{anyhow, Result};
use std::fmt::Debug;
use std::ops::Range;
use std::path::Path;

/// Encoding-specific behavior plugged into the merge job.
pub trait FormatStrategy: Send + Sync {
    type Key: Copy + Ord + Send + Sync + Debug;
    type Value: Send + Sync;

    fn format(&self) -> MatrixFormat;

    /// Read one input split, emitting each record's key and value.
    fn read_split(&self, path: &Path, emit: &mut dyn FnMut(Self::Key, Self::Value))
        -> Result<()>;

    /// Size of the row-major key space.
    fn key_space(&self) -> u128;

    /// Row-major position of a key, `None` if it lies outside the matrix.
    fn position(&self, key: &Self::Key) -> Option<u128>;

    /// Resolve every group of one partition and write the winners to `out`.
    ///
    /// `positions` is the partition's slice of the key space; groups arrive
    /// in key order with each group's records in tag order. Returns the
    /// number of non-zero cells written.
    fn reduce<'a, I>(&self, positions: Range<u128>, groups: I, out: &Path) -> Result<u64>
    where
        I: Iterator<Item = &'a [TaggedRecord<Self::Key, Self::Value>]>,
        Self::Key: 'a,
        Self::Value: 'a;
}

fn resolve_group(group: &[TaggedRecord<CellIndex, f64>]) -> Option<f64> {
    let mut resolver = CellResolver::new();
    for record in group {
        resolver.observe(record.tag, record.value);
    }
    resolver.finish()
}

/// Sparse coordinate text: absent keys stay absent.
#[derive(Debug, Clone)]
pub struct TextCellStrategy {
    mc: MatrixCharacteristics,
}

impl TextCellStrategy {
    pub fn new(mc: MatrixCharacteristics) -> Self {
        Self { mc }
    }
}

impl FormatStrategy for TextCellStrategy {
    type Key = CellIndex;
    type Value = f64;

    fn format(&self) -> MatrixFormat {
        MatrixFormat::TextCell
    }

    fn read_split(&self, path: &Path, emit: &mut dyn FnMut(CellIndex, f64)) -> Result<()> {
        formats::read_text_cells(path, emit)
    }

    fn key_space(&self) -> u128 {
        self.mc.num_cells()
    }

    fn position(&self, key: &CellIndex) -> Option<u128> {
        self.mc.cell_position(*key)
    }

    fn reduce<'a, I>(&self, _positions: Range<u128>, groups: I, out: &Path) -> Result<u64>
    where
        I: Iterator<Item = &'a [TaggedRecord<CellIndex, f64>]>,
    {
        let mut writer = TextCellWriter::create(out)?;
        let mut nnz = 0;
        for group in groups {
            if let Some(value) = resolve_group(group).filter(|v| *v != 0.0) {
                writer.write(group[0].key, value)?;
                nnz += 1;
            }
        }
        writer.finish()?;
        Ok(nnz)
    }
}

/// Indexed binary cells: every coordinate of the partition is written once,
/// with an implicit zero where no record exists.
#[derive(Debug, Clone)]
pub struct BinaryCellStrategy {
    mc: MatrixCharacteristics,
}

impl BinaryCellStrategy {
    pub fn new(mc: MatrixCharacteristics) -> Self {
        Self { mc }
    }
}

impl FormatStrategy for BinaryCellStrategy {
    type Key = CellIndex;
    type Value = f64;

    fn format(&self) -> MatrixFormat {
        MatrixFormat::BinaryCell
    }

    fn read_split(&self, path: &Path, emit: &mut dyn FnMut(CellIndex, f64)) -> Result<()> {
        formats::read_binary_cells(path, emit)
    }

    fn key_space(&self) -> u128 {
        self.mc.num_cells()
    }

    fn position(&self, key: &CellIndex) -> Option<u128> {
        self.mc.cell_position(*key)
    }

    fn reduce<'a, I>(&self, positions: Range<u128>, groups: I, out: &Path) -> Result<u64>
    where
        I: Iterator<Item = &'a [TaggedRecord<CellIndex, f64>]>,
    {
        let mut writer = BinaryCellWriter::create(out)?;
        let mut groups = groups.peekable();
        let mut nnz = 0;
        for position in positions {
            let index = self.mc.cell_at(position);
            let value = match groups.next_if(|g| g[0].key == index) {
                Some(group) => resolve_group(group).unwrap_or(0.0),
                None => 0.0,
            };
            writer.write(index, value)?;
            if value != 0.0 {
                nnz += 1;
            }
        }
        if let Some(stray) = groups.next() {
            return Err(anyhow!("cell {} routed outside its partition", stray[0].key));
        }
        writer.finish()?;
        Ok(nnz)
    }
}

/// Partitioned blocks: one elementwise block merge per block key.
#[derive(Debug, Clone)]
pub struct BinaryBlockStrategy {
    mc: MatrixCharacteristics,
}

impl BinaryBlockStrategy {
    pub fn new(mc: MatrixCharacteristics) -> Self {
        Self { mc }
    }
}

impl FormatStrategy for BinaryBlockStrategy {
    type Key = BlockIndex;
    type Value = MatrixBlock;

    fn format(&self) -> MatrixFormat {
        MatrixFormat::BinaryBlock
    }

    fn read_split(&self, path: &Path, emit: &mut dyn FnMut(BlockIndex, MatrixBlock)) -> Result<()> {
        formats::read_binary_blocks(path, emit)
    }

    fn key_space(&self) -> u128 {
        self.mc.num_blocks()
    }

    fn position(&self, key: &BlockIndex) -> Option<u128> {
        self.mc.block_position(*key)
    }

    fn reduce<'a, I>(&self, _positions: Range<u128>, groups: I, out: &Path) -> Result<u64>
    where
        I: Iterator<Item = &'a [TaggedRecord<BlockIndex, MatrixBlock>]>,
    {
        let mut writer = BinaryBlockWriter::create(out)?;
        let mut nnz = 0;
        for group in groups {
            let index = group[0].key;
            let (rows, cols) = self.mc.block_dims(index);
            let mut merger = BlockMerger::new(rows, cols);
            for record in group {
                merger
                    .observe(record.tag, &record.value)
                    .map_err(|e| e.context(format!("merging block {index}")))?;
            }
            let merged = merger.finish()?;
            nnz += merged.nnz();
            writer.write(index, &merged)?;
        }
        writer.finish()?;
        Ok(nnz)
    }
}
