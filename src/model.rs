//! # Model Module
//!
//! Matrix metadata, coordinates, and the block representation shared by the
//! readers, the resolver, and the merge job.

use crate::error::MergeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fraction of non-zeros below which a block is stored in sparse form.
pub const SPARSITY_TURN_POINT: f64 = 0.4;

/// Physical encoding of a matrix on stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatrixFormat {
    /// `row col value` lines, one per non-zero cell.
    TextCell,
    /// Fixed-size `(row, col) -> value` records covering every coordinate.
    BinaryCell,
    /// `(block-row, block-col) -> block` records.
    BinaryBlock,
}

impl MatrixFormat {
    /// Cell encodings key records by cell coordinate.
    pub fn is_cell(self) -> bool {
        matches!(self, MatrixFormat::TextCell | MatrixFormat::BinaryCell)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatrixFormat::TextCell => "text-cell",
            MatrixFormat::BinaryCell => "binary-cell",
            MatrixFormat::BinaryBlock => "binary-block",
        }
    }
}

impl fmt::Display for MatrixFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatrixFormat {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text-cell" | "textcell" | "text" => Ok(MatrixFormat::TextCell),
            "binary-cell" | "binarycell" => Ok(MatrixFormat::BinaryCell),
            "binary-block" | "binaryblock" => Ok(MatrixFormat::BinaryBlock),
            other => Err(MergeError::config(format!("unsupported output format `{other}`"))),
        }
    }
}

/// Dimensions, blocking, and non-zero count of a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixCharacteristics {
    pub rows: u64,
    pub cols: u64,
    pub rows_per_block: u32,
    pub cols_per_block: u32,
    pub nnz: u64,
}

impl MatrixCharacteristics {
    pub fn new(rows: u64, cols: u64, rows_per_block: u32, cols_per_block: u32) -> Self {
        Self {
            rows,
            cols,
            rows_per_block,
            cols_per_block,
            nnz: 0,
        }
    }

    pub fn with_nnz(mut self, nnz: u64) -> Self {
        self.nnz = nnz;
        self
    }

    /// Reject empty shapes and zero block sizes.
    pub fn validate(&self) -> Result<(), MergeError> {
        if self.rows == 0 || self.cols == 0 {
            return Err(MergeError::config(format!(
                "matrix dimensions must be positive, got {}x{}",
                self.rows, self.cols
            )));
        }
        if self.rows_per_block == 0 || self.cols_per_block == 0 {
            return Err(MergeError::config(format!(
                "block sizes must be positive, got {}x{}",
                self.rows_per_block, self.cols_per_block
            )));
        }
        Ok(())
    }

    /// Same rows, columns, and blocking (nnz is not compared).
    pub fn same_shape(&self, other: &MatrixCharacteristics) -> bool {
        self.rows == other.rows
            && self.cols == other.cols
            && self.rows_per_block == other.rows_per_block
            && self.cols_per_block == other.cols_per_block
    }

    pub fn num_row_blocks(&self) -> u64 {
        self.rows.div_ceil(self.rows_per_block as u64)
    }

    pub fn num_col_blocks(&self) -> u64 {
        self.cols.div_ceil(self.cols_per_block as u64)
    }

    pub fn num_blocks(&self) -> u128 {
        self.num_row_blocks() as u128 * self.num_col_blocks() as u128
    }

    pub fn num_cells(&self) -> u128 {
        self.rows as u128 * self.cols as u128
    }

    pub fn contains_cell(&self, index: CellIndex) -> bool {
        (1..=self.rows).contains(&index.row) && (1..=self.cols).contains(&index.col)
    }

    pub fn contains_block(&self, index: BlockIndex) -> bool {
        (1..=self.num_row_blocks()).contains(&index.row)
            && (1..=self.num_col_blocks()).contains(&index.col)
    }

    /// Row-major position of a cell, or `None` if it lies outside the matrix.
    pub fn cell_position(&self, index: CellIndex) -> Option<u128> {
        self.contains_cell(index)
            .then(|| (index.row - 1) as u128 * self.cols as u128 + (index.col - 1) as u128)
    }

    pub fn cell_at(&self, position: u128) -> CellIndex {
        let cols = self.cols as u128;
        CellIndex::new((position / cols) as u64 + 1, (position % cols) as u64 + 1)
    }

    /// Row-major position of a block, or `None` if it lies outside the matrix.
    pub fn block_position(&self, index: BlockIndex) -> Option<u128> {
        self.contains_block(index).then(|| {
            (index.row - 1) as u128 * self.num_col_blocks() as u128 + (index.col - 1) as u128
        })
    }

    /// Actual extent of a block; boundary blocks are truncated.
    pub fn block_dims(&self, index: BlockIndex) -> (u32, u32) {
        let brlen = self.rows_per_block as u64;
        let bclen = self.cols_per_block as u64;
        let rows = brlen.min(self.rows - (index.row - 1) * brlen);
        let cols = bclen.min(self.cols - (index.col - 1) * bclen);
        (rows as u32, cols as u32)
    }

    /// Block containing a cell and the cell's 0-based offset inside it.
    pub fn locate_cell(&self, index: CellIndex) -> (BlockIndex, u32, u32) {
        let brlen = self.rows_per_block as u64;
        let bclen = self.cols_per_block as u64;
        let block = BlockIndex::new((index.row - 1) / brlen + 1, (index.col - 1) / bclen + 1);
        (
            block,
            ((index.row - 1) % brlen) as u32,
            ((index.col - 1) % bclen) as u32,
        )
    }

    /// Global 1-based cell coordinate of an offset inside a block.
    pub fn cell_in_block(&self, block: BlockIndex, r: u32, c: u32) -> CellIndex {
        CellIndex::new(
            (block.row - 1) * self.rows_per_block as u64 + r as u64 + 1,
            (block.col - 1) * self.cols_per_block as u64 + c as u64 + 1,
        )
    }
}

/// 1-based cell coordinate. Ordering is row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellIndex {
    pub row: u64,
    pub col: u64,
}

impl CellIndex {
    pub fn new(row: u64, col: u64) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.row, self.col)
    }
}

/// 1-based block coordinate. Ordering is row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex {
    pub row: u64,
    pub col: u64,
}

impl BlockIndex {
    pub fn new(row: u64, col: u64) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.row, self.col)
    }
}

/// Storage of a block's values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlockData {
    /// Row-major values, `rows * cols` long.
    Dense(Vec<f64>),
    /// Non-zero `(row, col, value)` triples, 0-based, sorted row-major.
    Sparse(Vec<(u32, u32, f64)>),
}

/// A rectangular tile of a matrix, at most `rows_per_block x cols_per_block`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixBlock {
    rows: u32,
    cols: u32,
    data: BlockData,
}

impl MatrixBlock {
    pub fn zeros(rows: u32, cols: u32) -> Self {
        Self {
            rows,
            cols,
            data: BlockData::Sparse(Vec::new()),
        }
    }

    /// Dense block from row-major values.
    pub fn dense(rows: u32, cols: u32, values: Vec<f64>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            values.len() == rows as usize * cols as usize,
            "dense block {rows}x{cols} needs {} values, got {}",
            rows as usize * cols as usize,
            values.len()
        );
        Ok(Self {
            rows,
            cols,
            data: BlockData::Dense(values),
        })
    }

    /// Sparse block from unordered triples; zeros are dropped and the last
    /// value written to a position is kept.
    pub fn sparse(rows: u32, cols: u32, mut entries: Vec<(u32, u32, f64)>) -> anyhow::Result<Self> {
        if let Some(&(r, c, _)) = entries.iter().find(|(r, c, _)| *r >= rows || *c >= cols) {
            anyhow::bail!("entry ({r},{c}) outside {rows}x{cols} block");
        }
        entries.sort_by_key(|&(r, c, _)| (r, c));
        let mut deduped: Vec<(u32, u32, f64)> = Vec::with_capacity(entries.len());
        for entry in entries {
            match deduped.last_mut() {
                Some(last) if (last.0, last.1) == (entry.0, entry.1) => *last = entry,
                _ => deduped.push(entry),
            }
        }
        deduped.retain(|&(_, _, v)| v != 0.0);
        Ok(Self {
            rows,
            cols,
            data: BlockData::Sparse(deduped),
        })
    }

    /// Check the invariants the constructors enforce. Decoded blocks bypass
    /// the constructors and must pass this before use.
    pub fn validate(&self) -> anyhow::Result<()> {
        let (rows, cols) = (self.rows, self.cols);
        match &self.data {
            BlockData::Dense(values) => anyhow::ensure!(
                values.len() == self.len(),
                "dense block {rows}x{cols} holds {} values",
                values.len()
            ),
            BlockData::Sparse(entries) => {
                if let Some(&(r, c, _)) = entries.iter().find(|(r, c, _)| *r >= rows || *c >= cols) {
                    anyhow::bail!("entry ({r},{c}) outside {rows}x{cols} block");
                }
                anyhow::ensure!(
                    entries.windows(2).all(|w| (w[0].0, w[0].1) < (w[1].0, w[1].1)),
                    "sparse block {rows}x{cols} entries are not strictly row-major"
                );
            }
        }
        Ok(())
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn data(&self) -> &BlockData {
        &self.data
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.data, BlockData::Sparse(_))
    }

    pub fn len(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, r: u32, c: u32) -> f64 {
        match &self.data {
            BlockData::Dense(values) => values[r as usize * self.cols as usize + c as usize],
            BlockData::Sparse(entries) => entries
                .binary_search_by_key(&(r, c), |&(er, ec, _)| (er, ec))
                .map(|i| entries[i].2)
                .unwrap_or(0.0),
        }
    }

    pub fn nnz(&self) -> u64 {
        match &self.data {
            BlockData::Dense(values) => values.iter().filter(|v| **v != 0.0).count() as u64,
            BlockData::Sparse(entries) => entries.len() as u64,
        }
    }

    /// Non-zero entries in row-major order.
    pub fn nonzeros(&self) -> Vec<(u32, u32, f64)> {
        match &self.data {
            BlockData::Sparse(entries) => entries.clone(),
            BlockData::Dense(values) => {
                let cols = self.cols as usize;
                values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| **v != 0.0)
                    .map(|(i, v)| ((i / cols) as u32, (i % cols) as u32, *v))
                    .collect()
            }
        }
    }

    /// Write this block's values into a row-major buffer of its size.
    pub fn fill_dense(&self, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.len());
        match &self.data {
            BlockData::Dense(values) => out.copy_from_slice(values),
            BlockData::Sparse(entries) => {
                out.fill(0.0);
                let cols = self.cols as usize;
                for &(r, c, v) in entries {
                    out[r as usize * cols + c as usize] = v;
                }
            }
        }
    }

    pub fn to_dense_values(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.len()];
        self.fill_dense(&mut out);
        out
    }

    /// Build a block from row-major values, choosing the cheaper representation.
    pub fn from_dense_values(rows: u32, cols: u32, values: Vec<f64>) -> anyhow::Result<Self> {
        Self::dense(rows, cols, values).map(Self::compact)
    }

    /// Switch representation according to [`SPARSITY_TURN_POINT`].
    pub fn compact(self) -> Self {
        let len = self.len();
        let sparse_wanted = len == 0 || (self.nnz() as f64) < SPARSITY_TURN_POINT * len as f64;
        match (sparse_wanted, self.data) {
            (true, BlockData::Dense(values)) => {
                let cols = self.cols as usize;
                let entries = values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| **v != 0.0)
                    .map(|(i, v)| ((i / cols) as u32, (i % cols) as u32, *v))
                    .collect();
                Self {
                    rows: self.rows,
                    cols: self.cols,
                    data: BlockData::Sparse(entries),
                }
            }
            (false, BlockData::Sparse(entries)) => {
                let mut values = vec![0.0; len];
                let cols = self.cols as usize;
                for (r, c, v) in entries {
                    values[r as usize * cols + c as usize] = v;
                }
                Self {
                    rows: self.rows,
                    cols: self.cols,
                    data: BlockData::Dense(values),
                }
            }
            (_, data) => Self {
                rows: self.rows,
                cols: self.cols,
                data,
            },
        }
    }
}
