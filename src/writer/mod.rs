//! Partitioned Parquet output.
//!
//! [`Writer::write`] creates the output directory fresh, writes every
//! partition in parallel, then the category dictionary if there is one, and
//! finishes with the manifest:
//!
//! ```text
//! out/
//! ├── manifest.toml
//! ├── categories/                (write_with_dictionary)
//! ├── part.00000.000.parquet
//! ├── part.00000.001.parquet     (files_per_partition > 1)
//! └── part.00001.000.parquet
//! ```
//!
//! Every file goes to `.<name>.tmp` first and is renamed when complete.
//! A [`PartitionFileWriter`] dropped before `commit` deletes its temp file,
//! and any failure (including cancellation) removes the whole output
//! directory, so no final-named file exists unless the write succeeded.
//! The manifest is the completion marker: it is written last.

pub mod manifest;
pub mod options;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::categorify::CategoryDictionary;
use crate::constants::{files, WRITE_BATCH_ROWS};
use crate::dataset::Dataset;
use crate::error::{PrepError, Result};
use crate::executor::{CancelToken, Executor};
use crate::memory::format_bytes;
use crate::schema::{schema_to_entries, ColumnEntry};

pub use manifest::{is_output_dir, FileEntry, Manifest};
pub use options::{ParquetCompression, ParquetWriteOptions, WriteOptions};

/// Writes one Parquet file under a temporary name until committed.
pub struct PartitionFileWriter {
    final_path: PathBuf,
    temp_path: PathBuf,
    writer: Option<ArrowWriter<File>>,
    rows: u64,
    committed: bool,
}

impl PartitionFileWriter {
    pub fn create(
        dir: &Path,
        name: &str,
        schema: SchemaRef,
        props: WriterProperties,
    ) -> Result<Self> {
        let final_path = dir.join(name);
        let temp_path = dir.join(files::temp_name(name));
        let file = File::create(&temp_path)
            .map_err(|e| PrepError::io(&temp_path, "create partition file", e))?;
        let writer = ArrowWriter::try_new(file, schema, Some(props))?;
        Ok(Self {
            final_path,
            temp_path,
            writer: Some(writer),
            rows: 0,
            committed: false,
        })
    }

    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PrepError::validation("write after close"))?;
        writer.write(batch)?;
        self.rows += batch.num_rows() as u64;
        Ok(())
    }

    /// Bytes flushed to the file so far.
    pub fn bytes_written(&self) -> usize {
        self.writer.as_ref().map(|w| w.bytes_written()).unwrap_or(0)
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Close the file and move it to its final name.
    ///
    /// Returns `(final_path, rows, bytes)`.
    pub fn commit(mut self) -> Result<(PathBuf, u64, u64)> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| PrepError::validation("commit after close"))?;
        writer.close()?;
        fs::rename(&self.temp_path, &self.final_path)
            .map_err(|e| PrepError::io(&self.final_path, "rename partition file", e))?;
        self.committed = true;

        let bytes = fs::metadata(&self.final_path)
            .map_err(|e| PrepError::io(&self.final_path, "stat partition file", e))?
            .len();
        Ok((self.final_path.clone(), self.rows, bytes))
    }
}

impl Drop for PartitionFileWriter {
    fn drop(&mut self) {
        if !self.committed {
            drop(self.writer.take());
            if fs::remove_file(&self.temp_path).is_ok() {
                log::debug!("Removed uncommitted {}", self.temp_path.display());
            }
        }
    }
}

/// Contiguous `(offset, len)` row ranges splitting `rows` into at most
/// `files` parts. Always at least one range, possibly empty.
pub fn split_rows(rows: usize, files: usize) -> Vec<(usize, usize)> {
    let n = files.min(rows).max(1);
    let base = rows / n;
    let extra = rows % n;
    let mut ranges = Vec::with_capacity(n);
    let mut offset = 0;
    for j in 0..n {
        let len = base + usize::from(j < extra);
        ranges.push((offset, len));
        offset += len;
    }
    ranges
}

/// Writes datasets as partitioned Parquet with a manifest.
#[derive(Debug, Clone, Default)]
pub struct Writer {
    options: WriteOptions,
}

impl Writer {
    pub fn new(options: WriteOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    /// Write every partition of `dataset` into `output_dir`.
    ///
    /// # Errors
    /// - `OutputExists` if the directory exists and overwrite is off
    /// - `Validation` if `output_dir` holds any file the dataset reads from
    /// - `Cancelled` if the executor's token is cancelled mid-write
    /// - any read, transform or I/O error from a partition
    pub fn write<E: Executor>(
        &self,
        dataset: &Dataset,
        output_dir: &Path,
        executor: &E,
    ) -> Result<Manifest> {
        self.write_with_dictionary(dataset, output_dir, None, executor)
    }

    /// Like [`write`](Self::write), also saving `dictionary` to
    /// `output_dir/categories` before the manifest.
    pub fn write_with_dictionary<E: Executor>(
        &self,
        dataset: &Dataset,
        output_dir: &Path,
        dictionary: Option<&CategoryDictionary>,
        executor: &E,
    ) -> Result<Manifest> {
        self.options.validate()?;
        let props = self.options.parquet.to_writer_properties()?;
        let entries = schema_to_entries(&dataset.schema())?;
        check_not_reading_from(dataset, output_dir)?;
        prepare_output_dir(output_dir, self.options.overwrite)?;

        let result = self.write_into(dataset, output_dir, dictionary, props, entries, executor);
        if let Err(e) = &result {
            log::warn!(
                "Write to {} failed ({}); removing partial output",
                output_dir.display(),
                e
            );
            if let Err(cleanup) = fs::remove_dir_all(output_dir) {
                log::warn!("Failed to remove {}: {}", output_dir.display(), cleanup);
            }
        }
        result
    }

    fn write_into<E: Executor>(
        &self,
        dataset: &Dataset,
        output_dir: &Path,
        dictionary: Option<&CategoryDictionary>,
        props: WriterProperties,
        entries: Vec<ColumnEntry>,
        executor: &E,
    ) -> Result<Manifest> {
        let t_start = Instant::now();
        let partitions = dataset.num_partitions();
        log::info!(
            "Writing {} partition(s) to {} ({} file(s) per partition)",
            partitions,
            output_dir.display(),
            self.options.files_per_partition
        );

        let cancel = executor.cancel_token();
        let per_partition = executor.run("write", partitions, |i| {
            self.write_partition(dataset, i, output_dir, &props, cancel)
        })?;

        if let Some(dictionary) = dictionary {
            cancel.check()?;
            dictionary.save(&output_dir.join(files::CATEGORIES_DIR))?;
        }

        let files: Vec<FileEntry> = per_partition.into_iter().flatten().collect();
        let manifest = Manifest::new(entries, partitions, files);
        manifest.save(output_dir)?;

        log::info!(
            "Wrote {} rows in {} file(s), {} in {:.2?}",
            manifest.total_rows,
            manifest.files.len(),
            format_bytes(manifest.total_bytes() as usize),
            t_start.elapsed()
        );
        Ok(manifest)
    }

    fn write_partition(
        &self,
        dataset: &Dataset,
        index: usize,
        output_dir: &Path,
        props: &WriterProperties,
        cancel: &CancelToken,
    ) -> Result<Vec<FileEntry>> {
        let partition = dataset.read_partition(index)?;
        let batch = partition.batch();
        let mut entries = Vec::new();

        let ranges = split_rows(batch.num_rows(), self.options.files_per_partition);
        for (file_index, (offset, len)) in ranges.into_iter().enumerate() {
            let name = files::part_file(index, file_index);
            let slice = batch.slice(offset, len);
            let mut writer =
                PartitionFileWriter::create(output_dir, &name, batch.schema(), props.clone())?;

            let mut written = 0;
            while written < len {
                cancel.check()?;
                let chunk = WRITE_BATCH_ROWS.min(len - written);
                writer.write(&slice.slice(written, chunk))?;
                written += chunk;
            }
            cancel.check()?;

            let (_, rows, bytes) = writer.commit()?;
            entries.push(FileEntry {
                path: name,
                partition: index,
                file_index,
                num_rows: rows,
                num_bytes: bytes,
            });
        }
        Ok(entries)
    }
}

/// Refuse an output directory that contains any file `dataset` reads from.
pub(crate) fn check_not_reading_from(dataset: &Dataset, output_dir: &Path) -> Result<()> {
    let (Some(planned), Ok(output)) = (dataset.planned_partitions(), output_dir.canonicalize())
    else {
        return Ok(());
    };
    for piece in planned.iter().flat_map(|p| &p.pieces) {
        let source = piece
            .path
            .canonicalize()
            .unwrap_or_else(|_| piece.path.clone());
        if source.starts_with(&output) {
            return Err(PrepError::validation(format!(
                "Output directory {} contains input file {}",
                output_dir.display(),
                piece.path.display()
            )));
        }
    }
    Ok(())
}

/// Create `dir` fresh, replacing it only when `overwrite` is set.
fn prepare_output_dir(dir: &Path, overwrite: bool) -> Result<()> {
    if dir.exists() {
        if !overwrite {
            return Err(PrepError::OutputExists {
                path: dir.to_path_buf(),
            });
        }
        log::info!("Removing existing output {}", dir.display());
        if dir.is_dir() {
            fs::remove_dir_all(dir).map_err(|e| PrepError::io(dir, "remove old output", e))?;
        } else {
            fs::remove_file(dir).map_err(|e| PrepError::io(dir, "remove old output", e))?;
        }
    }
    fs::create_dir_all(dir).map_err(|e| PrepError::io(dir, "create output directory", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ParallelExecutor, SequentialExecutor};
    use crate::transform::ColumnTransform;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn batch(lo: i64, hi: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from_iter_values(lo..hi))]).unwrap()
    }

    fn part_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|n| n.starts_with("part."))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn test_split_rows() {
        assert_eq!(split_rows(10, 3), vec![(0, 4), (4, 3), (7, 3)]);
        assert_eq!(split_rows(2, 5), vec![(0, 1), (1, 1)]);
        assert_eq!(split_rows(0, 4), vec![(0, 0)]);
    }

    #[test]
    fn test_write_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let ds = Dataset::from_batches(vec![batch(0, 100), batch(100, 150)]).unwrap();
        let writer = Writer::new(WriteOptions {
            files_per_partition: 2,
            ..Default::default()
        });
        let manifest = writer.write(&ds, &out, &ParallelExecutor::new()).unwrap();

        assert_eq!(manifest.total_rows, 150);
        assert_eq!(manifest.files.len(), 4);
        assert_eq!(
            part_files(&out),
            vec![
                "part.00000.000.parquet",
                "part.00000.001.parquet",
                "part.00001.000.parquet",
                "part.00001.001.parquet"
            ]
        );

        let reread = Dataset::from_manifest(&out).unwrap();
        assert_eq!(reread.num_partitions(), 2);
        assert_eq!(reread.total_rows(), 150);
        assert_eq!(reread.schema().fields(), ds.schema().fields());
        let first = reread.read_partition(0).unwrap();
        assert_eq!(first.num_rows(), 100);
    }

    #[test]
    fn test_existing_output_rejected_then_overwritten() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        fs::create_dir(&out).unwrap();
        fs::write(out.join("keep.txt"), "x").unwrap();
        let ds = Dataset::from_batches(vec![batch(0, 10)]).unwrap();

        let err = Writer::default()
            .write(&ds, &out, &SequentialExecutor::new())
            .unwrap_err();
        assert!(matches!(err, PrepError::OutputExists { .. }));
        assert!(out.join("keep.txt").exists(), "existing output must survive");

        let writer = Writer::new(WriteOptions {
            overwrite: true,
            ..Default::default()
        });
        writer.write(&ds, &out, &SequentialExecutor::new()).unwrap();
        assert!(!out.join("keep.txt").exists());
        assert!(is_output_dir(&out));
    }

    #[test]
    fn test_uncommitted_file_writer_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let b = batch(0, 10);
        let name = files::part_file(0, 0);
        {
            let mut w = PartitionFileWriter::create(
                tmp.path(),
                &name,
                b.schema(),
                WriterProperties::builder().build(),
            )
            .unwrap();
            w.write(&b).unwrap();
            assert!(tmp.path().join(files::temp_name(&name)).exists());
        }
        assert!(!tmp.path().join(files::temp_name(&name)).exists());
        assert!(!tmp.path().join(&name).exists());
    }

    /// Cancels the shared token the first time partition 1 is read.
    #[derive(Debug)]
    struct CancelOnRead {
        schema: SchemaRef,
        token: CancelToken,
    }

    impl ColumnTransform for CancelOnRead {
        fn name(&self) -> &'static str {
            "cancel_on_read"
        }
        fn input_schema(&self) -> &SchemaRef {
            &self.schema
        }
        fn output_schema(&self) -> &SchemaRef {
            &self.schema
        }
        fn apply(&self, batch: &RecordBatch) -> crate::error::Result<RecordBatch> {
            let ids = batch.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
            if ids.value(0) >= 100 {
                self.token.cancel();
            }
            Ok(batch.clone())
        }
    }

    #[test]
    fn test_cancellation_leaves_no_final_files() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let token = CancelToken::new();
        let ds = Dataset::from_batches(vec![batch(0, 100), batch(100, 200), batch(200, 300)])
            .unwrap();
        let ds = ds
            .with_transform(Arc::new(CancelOnRead {
                schema: ds.schema(),
                token: token.clone(),
            }))
            .unwrap();

        let exec = SequentialExecutor::new().with_cancel_token(token);
        let err = Writer::default().write(&ds, &out, &exec).unwrap_err();
        assert!(matches!(err.root_cause(), PrepError::Cancelled));
        assert!(part_files(&out).is_empty());
        assert!(!out.join(files::MANIFEST).exists());
    }

    fn dictionary(columns: &[&str], with_values: bool) -> CategoryDictionary {
        let mut dictionaries = std::collections::HashMap::new();
        if with_values {
            for &name in columns {
                let frequencies = std::collections::HashMap::from([("v".to_string(), 3u64)]);
                dictionaries.insert(
                    name.to_string(),
                    crate::categorify::ColumnDictionary::from_frequencies(frequencies, 1),
                );
            }
        }
        let columns = columns.iter().map(|c| c.to_string()).collect();
        CategoryDictionary::from_parts(columns, vec![], dictionaries)
    }

    #[test]
    fn test_dictionary_written_before_manifest() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let ds = Dataset::from_batches(vec![batch(0, 10)]).unwrap();
        let dict = dictionary(&["c"], true);

        Writer::default()
            .write_with_dictionary(&ds, &out, Some(&dict), &SequentialExecutor::new())
            .unwrap();
        assert!(is_output_dir(&out));
        let loaded = CategoryDictionary::load(&out.join(files::CATEGORIES_DIR)).unwrap();
        assert_eq!(loaded, dict);
    }

    #[test]
    fn test_failed_dictionary_leaves_no_manifest() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let ds = Dataset::from_batches(vec![batch(0, 10)]).unwrap();
        let broken = dictionary(&["c"], false);

        let result = Writer::default().write_with_dictionary(
            &ds,
            &out,
            Some(&broken),
            &SequentialExecutor::new(),
        );
        assert!(result.is_err());
        assert!(!is_output_dir(&out));
        assert!(!out.exists());
    }
}
