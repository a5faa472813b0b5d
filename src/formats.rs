//! # Formats Module
//!
//! Readers and writers for the three physical matrix encodings.
//!
//! A storage location is either a single file or a directory of part files.
//! Directory entries whose names start with `_` or `.` (markers, attempt
//! scratch) are not data and are skipped.

use crate::model::{BlockIndex, CellIndex, MatrixBlock, MatrixCharacteristics, MatrixFormat};
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Name of the part file written by reducer `task`.
pub fn part_file_name(task: usize) -> String {
    format!("part-{task:05}")
}

fn is_data_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| !n.starts_with('_') && !n.starts_with('.'))
        .unwrap_or(false)
}

/// Data files of a storage location, in name order.
pub fn list_part_files(path: &Path) -> Result<Vec<PathBuf>> {
    let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if meta.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut parts = Vec::new();
    for entry in fs::read_dir(path).with_context(|| format!("list {}", path.display()))? {
        let entry = entry?;
        let entry_path = entry.path();
        if entry.file_type()?.is_file() && is_data_file(&entry_path) {
            parts.push(entry_path);
        }
    }
    parts.sort();
    Ok(parts)
}

/// Absolute form of `path` with its longest existing prefix canonicalized.
fn normalize_location(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(existing) {
            return missing
                .iter()
                .rev()
                .fold(canonical, |acc: PathBuf, name| acc.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute.components().collect(),
        }
    }
}

/// True when one storage location is, or lies inside, the other.
pub fn locations_overlap(a: &Path, b: &Path) -> bool {
    let (a, b) = (normalize_location(a), normalize_location(b));
    a.starts_with(&b) || b.starts_with(&a)
}

fn open_reader(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    Ok(BufReader::new(file))
}

/// Stream `row col value` lines.
pub fn read_text_cells(path: &Path, emit: &mut dyn FnMut(CellIndex, f64)) -> Result<()> {
    let reader = open_reader(path)?;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut fields = trimmed.split_whitespace();
        let parsed = (|| -> Option<(u64, u64, f64)> {
            let row = fields.next()?.parse().ok()?;
            let col = fields.next()?.parse().ok()?;
            let value = fields.next()?.parse().ok()?;
            fields.next().is_none().then_some((row, col, value))
        })();
        match parsed {
            Some((row, col, value)) => emit(CellIndex::new(row, col), value),
            None => bail!(
                "malformed text cell at {}:{}: `{}`",
                path.display(),
                line_no + 1,
                trimmed
            ),
        }
    }
    Ok(())
}

/// Stream fixed-size `(row, col, value)` records.
pub fn read_binary_cells(path: &Path, emit: &mut dyn FnMut(CellIndex, f64)) -> Result<()> {
    let mut reader = open_reader(path)?;
    while !reader.fill_buf()?.is_empty() {
        let (row, col, value): (u64, u64, f64) = bincode::deserialize_from(&mut reader)
            .with_context(|| format!("decode binary cell in {}", path.display()))?;
        emit(CellIndex::new(row, col), value);
    }
    Ok(())
}

/// Stream `(block index, block)` records.
pub fn read_binary_blocks(
    path: &Path,
    emit: &mut dyn FnMut(BlockIndex, MatrixBlock),
) -> Result<()> {
    let mut reader = open_reader(path)?;
    while !reader.fill_buf()?.is_empty() {
        let (index, block): (BlockIndex, MatrixBlock) = bincode::deserialize_from(&mut reader)
            .with_context(|| format!("decode binary block in {}", path.display()))?;
        block
            .validate()
            .with_context(|| format!("corrupt block {index} in {}", path.display()))?;
        emit(index, block);
    }
    Ok(())
}

fn create_writer(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn finish_writer(writer: BufWriter<File>) -> Result<()> {
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

/// Writer for `row col value` lines.
pub struct TextCellWriter {
    inner: BufWriter<File>,
}

impl TextCellWriter {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            inner: create_writer(path)?,
        })
    }

    pub fn write(&mut self, index: CellIndex, value: f64) -> Result<()> {
        writeln!(self.inner, "{} {} {}", index.row, index.col, value)?;
        Ok(())
    }

    /// Flush and sync to stable storage.
    pub fn finish(self) -> Result<()> {
        finish_writer(self.inner)
    }
}

/// Writer for fixed-size binary cell records.
pub struct BinaryCellWriter {
    inner: BufWriter<File>,
}

impl BinaryCellWriter {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            inner: create_writer(path)?,
        })
    }

    pub fn write(&mut self, index: CellIndex, value: f64) -> Result<()> {
        bincode::serialize_into(&mut self.inner, &(index.row, index.col, value))?;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        finish_writer(self.inner)
    }
}

/// Writer for binary block records.
pub struct BinaryBlockWriter {
    inner: BufWriter<File>,
}

impl BinaryBlockWriter {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            inner: create_writer(path)?,
        })
    }

    pub fn write(&mut self, index: BlockIndex, block: &MatrixBlock) -> Result<()> {
        bincode::serialize_into(&mut self.inner, &(index, block))?;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        finish_writer(self.inner)
    }
}

/// Materialize a matrix given by its non-zero cells as a single-part directory.
///
/// Binary cell output enumerates every coordinate; block output contains only
/// non-empty blocks.
pub fn write_matrix(
    path: &Path,
    format: MatrixFormat,
    mc: &MatrixCharacteristics,
    cells: &BTreeMap<CellIndex, f64>,
) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)
            .or_else(|_| fs::remove_file(path))
            .with_context(|| format!("replace {}", path.display()))?;
    }
    fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))?;
    let part = path.join(part_file_name(0));
    match format {
        MatrixFormat::TextCell => {
            let mut writer = TextCellWriter::create(&part)?;
            for (index, value) in cells.iter().filter(|(_, v)| **v != 0.0) {
                writer.write(*index, *value)?;
            }
            writer.finish()
        }
        MatrixFormat::BinaryCell => {
            let mut writer = BinaryCellWriter::create(&part)?;
            for position in 0..mc.num_cells() {
                let index = mc.cell_at(position);
                writer.write(index, cells.get(&index).copied().unwrap_or(0.0))?;
            }
            writer.finish()
        }
        MatrixFormat::BinaryBlock => {
            let mut blocks: BTreeMap<BlockIndex, Vec<(u32, u32, f64)>> = BTreeMap::new();
            for (index, value) in cells.iter().filter(|(_, v)| **v != 0.0) {
                let (block, r, c) = mc.locate_cell(*index);
                blocks.entry(block).or_default().push((r, c, *value));
            }
            let mut writer = BinaryBlockWriter::create(&part)?;
            for (index, entries) in blocks {
                let (rows, cols) = mc.block_dims(index);
                let block = MatrixBlock::sparse(rows, cols, entries)?.compact();
                writer.write(index, &block)?;
            }
            writer.finish()
        }
    }
}

/// Read every data file of a location and collect its non-zero cells.
///
/// Later records for the same cell replace earlier ones.
pub fn read_matrix(
    path: &Path,
    format: MatrixFormat,
    mc: &MatrixCharacteristics,
) -> Result<BTreeMap<CellIndex, f64>> {
    let mut cells = BTreeMap::new();
    for part in list_part_files(path)? {
        match format {
            MatrixFormat::TextCell => read_text_cells(&part, &mut |index, value| {
                cells.insert(index, value);
            })?,
            MatrixFormat::BinaryCell => read_binary_cells(&part, &mut |index, value| {
                cells.insert(index, value);
            })?,
            MatrixFormat::BinaryBlock => read_binary_blocks(&part, &mut |index, block| {
                for r in 0..block.rows() {
                    for c in 0..block.cols() {
                        cells.insert(mc.cell_in_block(index, r, c), block.get(r, c));
                    }
                }
            })?,
        }
    }
    cells.retain(|_, v| *v != 0.0);
    Ok(cells)
}
