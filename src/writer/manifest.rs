//! Output manifest.
//!
//! `manifest.toml` sits next to the partition files and lists every file
//! with its source partition, row count and size, plus the output schema.
//! Readers rebuild the partitioning from it without scanning file footers.

use arrow::datatypes::SchemaRef;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::constants::{files, FORMAT_MAGIC, FORMAT_VERSION};
use crate::error::{PrepError, Result};
use crate::schema::{entries_to_schema, ColumnEntry};

/// Manifest describing one output directory.
///
/// Stored as TOML for human readability and easy inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Magic string for format identification.
    pub magic: String,

    /// Format version for compatibility checking.
    pub format_version: u32,

    /// Rows across all files.
    pub total_rows: u64,

    pub num_columns: usize,

    /// Input partitions the files were written from.
    pub num_partitions: usize,

    /// Output schema, in column order.
    pub schema: Vec<ColumnEntry>,

    /// Output files, ordered by partition then file index.
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

/// One output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the output directory.
    pub path: String,
    pub partition: usize,
    pub file_index: usize,
    pub num_rows: u64,
    pub num_bytes: u64,
}

impl Manifest {
    pub fn new(schema: Vec<ColumnEntry>, num_partitions: usize, files: Vec<FileEntry>) -> Self {
        Self {
            magic: FORMAT_MAGIC.to_string(),
            format_version: FORMAT_VERSION,
            total_rows: files.iter().map(|f| f.num_rows).sum(),
            num_columns: schema.len(),
            num_partitions,
            schema,
            files,
        }
    }

    pub fn arrow_schema(&self) -> SchemaRef {
        entries_to_schema(&self.schema)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.num_bytes).sum()
    }

    /// Save to `dir/manifest.toml` through a temporary file and rename.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(files::MANIFEST);
        let temp = dir.join(files::temp_name(files::MANIFEST));
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| PrepError::format(&path, format!("serialize: {}", e)))?;
        fs::write(&temp, toml_str).map_err(|e| PrepError::io(&temp, "write manifest", e))?;
        fs::rename(&temp, &path).map_err(|e| PrepError::io(&path, "rename manifest", e))?;
        Ok(())
    }

    /// Load and validate `dir/manifest.toml`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(files::MANIFEST);
        let toml_str =
            fs::read_to_string(&path).map_err(|e| PrepError::io(&path, "read manifest", e))?;
        let manifest: Self = toml::from_str(&toml_str)
            .map_err(|e| PrepError::format(&path, format!("invalid TOML: {}", e)))?;

        if manifest.magic != FORMAT_MAGIC {
            return Err(PrepError::format(
                &path,
                format!(
                    "invalid manifest magic: expected '{}', got '{}'",
                    FORMAT_MAGIC, manifest.magic
                ),
            ));
        }
        if manifest.format_version > FORMAT_VERSION {
            return Err(PrepError::format(
                &path,
                format!(
                    "unsupported format version: {} (max supported: {})",
                    manifest.format_version, FORMAT_VERSION
                ),
            ));
        }
        manifest.validate().map_err(|e| PrepError::format(&path, e.to_string()))?;
        Ok(manifest)
    }

    /// Check that the aggregate fields agree with the file list.
    pub fn validate(&self) -> Result<()> {
        let rows: u64 = self.files.iter().map(|f| f.num_rows).sum();
        if rows != self.total_rows {
            return Err(PrepError::validation(format!(
                "total_rows is {} but files hold {} rows",
                self.total_rows, rows
            )));
        }
        if self.num_columns != self.schema.len() {
            return Err(PrepError::validation(format!(
                "num_columns is {} but the schema has {} columns",
                self.num_columns,
                self.schema.len()
            )));
        }
        if let Some(f) = self.files.iter().find(|f| f.partition >= self.num_partitions) {
            return Err(PrepError::validation(format!(
                "file {} claims partition {} of {}",
                f.path, f.partition, self.num_partitions
            )));
        }
        Ok(())
    }
}

/// Whether `path` is a directory written by the writer.
pub fn is_output_dir(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    match fs::read_to_string(path.join(files::MANIFEST)) {
        Ok(content) => content.contains(FORMAT_MAGIC),
        Err(_) => false,
    }
}
