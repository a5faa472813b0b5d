//! # Matrix Module
//!
//! The matrix-handle abstraction consumed by the merge coordinator, plus two
//! implementations: an immutable file-backed [`MatrixHandle`] and a buffered
//! [`InMemoryMatrix`] that is written to stable storage on first export.

use crate::error::MergeError;
use crate::formats;
use crate::model::{CellIndex, MatrixCharacteristics, MatrixFormat};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A logical matrix as seen by the merge.
pub trait MatrixObject: Send + Sync + fmt::Debug {
    /// Logical variable name.
    fn var_name(&self) -> &str;
    /// Durable storage location.
    fn file_name(&self) -> &Path;
    fn format(&self) -> MatrixFormat;
    fn characteristics(&self) -> MatrixCharacteristics;
    /// Ensure the data resides on stable storage at [`MatrixObject::file_name`].
    fn export_data(&self) -> Result<(), MergeError>;
}

/// Path of the metadata sidecar for a storage location.
pub fn metadata_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".mtd");
    PathBuf::from(name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MatrixMetadata {
    name: String,
    format: MatrixFormat,
    #[serde(flatten)]
    characteristics: MatrixCharacteristics,
}

/// Immutable reference to a matrix that already lives on stable storage.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixHandle {
    name: String,
    path: PathBuf,
    format: MatrixFormat,
    characteristics: MatrixCharacteristics,
}

impl MatrixHandle {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        format: MatrixFormat,
        characteristics: MatrixCharacteristics,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            format,
            characteristics,
        }
    }

    /// Open a handle from the `.mtd` sidecar next to `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(metadata_path(path))?;
        let meta: MatrixMetadata = serde_json::from_str(&raw)?;
        Ok(Self::new(meta.name, path, meta.format, meta.characteristics))
    }

    /// Write the `.mtd` sidecar describing this handle.
    pub fn persist_metadata(&self) -> Result<(), MergeError> {
        let meta = MatrixMetadata {
            name: self.name.clone(),
            format: self.format,
            characteristics: self.characteristics,
        };
        let target = metadata_path(&self.path);
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| self.durability(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        fs::write(&target, json).map_err(|e| self.durability(e))
    }

    fn durability(&self, source: io::Error) -> MergeError {
        MergeError::Durability {
            name: self.name.clone(),
            path: self.path.clone(),
            source,
        }
    }
}

impl MatrixObject for MatrixHandle {
    fn var_name(&self) -> &str {
        &self.name
    }

    fn file_name(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> MatrixFormat {
        self.format
    }

    fn characteristics(&self) -> MatrixCharacteristics {
        self.characteristics
    }

    fn export_data(&self) -> Result<(), MergeError> {
        fs::metadata(&self.path)
            .map(|_| ())
            .map_err(|e| self.durability(e))
    }
}

/// A matrix held in memory until it is exported.
///
/// Stands in for a buffer-pool entry: cells live in memory and are written
/// to `path` in the matrix's format the first time `export_data` runs.
pub struct InMemoryMatrix {
    name: String,
    path: PathBuf,
    format: MatrixFormat,
    characteristics: MatrixCharacteristics,
    cells: BTreeMap<CellIndex, f64>,
    exported: Mutex<bool>,
}

impl fmt::Debug for InMemoryMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryMatrix")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("format", &self.format)
            .field("characteristics", &self.characteristics)
            .finish_non_exhaustive()
    }
}

impl InMemoryMatrix {
    /// Matrix from its non-zero cells. Zero values are dropped.
    pub fn from_cells(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        format: MatrixFormat,
        shape: MatrixCharacteristics,
        cells: impl IntoIterator<Item = (CellIndex, f64)>,
    ) -> anyhow::Result<Self> {
        let mut map = BTreeMap::new();
        for (index, value) in cells {
            anyhow::ensure!(
                shape.contains_cell(index),
                "cell {index} outside {}x{} matrix",
                shape.rows,
                shape.cols
            );
            if value != 0.0 {
                map.insert(index, value);
            } else {
                map.remove(&index);
            }
        }
        let characteristics = shape.with_nnz(map.len() as u64);
        Ok(Self {
            name: name.into(),
            path: path.into(),
            format,
            characteristics,
            cells: map,
            exported: Mutex::new(false),
        })
    }

    /// Matrix from row-major dense values.
    pub fn from_dense(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        format: MatrixFormat,
        shape: MatrixCharacteristics,
        values: &[f64],
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            values.len() as u128 == shape.num_cells(),
            "expected {} values, got {}",
            shape.num_cells(),
            values.len()
        );
        let cells = values
            .iter()
            .enumerate()
            .map(|(i, v)| (shape.cell_at(i as u128), *v));
        Self::from_cells(name, path, format, shape, cells)
    }

    /// Copy of this matrix with some cells overwritten, stored elsewhere.
    ///
    /// This is how an iteration's partial looks: the full output with its
    /// own writes applied.
    pub fn with_updates(
        &self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        updates: impl IntoIterator<Item = (CellIndex, f64)>,
    ) -> anyhow::Result<Self> {
        let cells = self
            .cells
            .iter()
            .map(|(k, v)| (*k, *v))
            .chain(updates)
            .collect::<Vec<_>>();
        Self::from_cells(name, path, self.format, self.characteristics, cells)
    }

    pub fn cells(&self) -> &BTreeMap<CellIndex, f64> {
        &self.cells
    }

    pub fn is_exported(&self) -> bool {
        *self.exported.lock()
    }

    fn durability(&self, source: io::Error) -> MergeError {
        MergeError::Durability {
            name: self.name.clone(),
            path: self.path.clone(),
            source,
        }
    }
}

impl MatrixObject for InMemoryMatrix {
    fn var_name(&self) -> &str {
        &self.name
    }

    fn file_name(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> MatrixFormat {
        self.format
    }

    fn characteristics(&self) -> MatrixCharacteristics {
        self.characteristics
    }

    fn export_data(&self) -> Result<(), MergeError> {
        let mut exported = self.exported.lock();
        if *exported {
            return Ok(());
        }
        formats::write_matrix(&self.path, self.format, &self.characteristics, &self.cells)
            .map_err(|e| {
                let source = match e.downcast::<io::Error>() {
                    Ok(io) => io,
                    Err(other) => io::Error::other(format!("{other:#}")),
                };
                self.durability(source)
            })?;
        *exported = true;
        Ok(())
    }
}
