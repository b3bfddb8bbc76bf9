//! Partitioned columnar datasets.
//!
//! A [`Dataset`] is a schema, a partition source and an ordered list of
//! attached transforms. Nothing is read until a partition is requested:
//! `read_partition(i)` reads the source slice for partition `i` and runs the
//! transforms over it. Attaching a transform returns a new `Dataset` and
//! leaves the original usable.
//!
//! Partition planning for Parquet sources only looks at file footers. Row
//! groups are packed in file order until the next one would exceed the byte
//! budget; partitions never span files, and a row group larger than the
//! budget becomes its own (oversized) partition.

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::constants::READ_BATCH_SIZE;
use crate::error::{PrepError, Result};
use crate::memory::{format_bytes, PartitionSize};
use crate::schema::{entries_to_schema, unify_schemas, validate_supported};
use crate::transform::ColumnTransform;
use crate::writer::Manifest;

/// A contiguous, independently processable chunk of a dataset's rows.
#[derive(Debug, Clone)]
pub struct Partition {
    index: usize,
    batch: RecordBatch,
}

impl Partition {
    pub fn new(index: usize, batch: RecordBatch) -> Self {
        Self { index, batch }
    }

    /// Position of this partition within its dataset.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_batch(self) -> RecordBatch {
        self.batch
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }
}

/// A piece of one Parquet file belonging to a planned partition.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePiece {
    pub path: PathBuf,
    /// Row groups to read; `None` reads the whole file.
    pub row_groups: Option<Vec<usize>>,
}

/// A partition planned from file metadata, not yet read.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedPartition {
    pub pieces: Vec<FilePiece>,
    pub num_rows: usize,
    /// Uncompressed size estimate from Parquet metadata.
    pub byte_size: usize,
}

#[derive(Debug)]
enum PartitionSource {
    Files(Vec<PlannedPartition>),
    Memory(Vec<RecordBatch>),
}

/// Row-group sizes of one Parquet file, as read from its footer.
#[derive(Debug, Clone)]
pub struct FileLayout {
    pub path: PathBuf,
    /// `(num_rows, uncompressed_bytes)` per row group, in file order.
    pub row_groups: Vec<(usize, usize)>,
}

/// An ordered sequence of partitions sharing one schema.
#[derive(Debug, Clone)]
pub struct Dataset {
    base_schema: SchemaRef,
    schema: SchemaRef,
    source: Arc<PartitionSource>,
    transforms: Vec<Arc<dyn ColumnTransform>>,
}

impl Dataset {
    /// Open Parquet files and directories as a partitioned dataset.
    ///
    /// Directories expand to their `*.parquet` files in lexical order,
    /// skipping names that start with `.` or `_`.
    ///
    /// # Errors
    /// - `SourceNotFound` if a listed path does not exist or nothing matched
    /// - `SchemaMismatch` if files disagree on column names, order or types
    pub fn open(sources: &[PathBuf], size: PartitionSize) -> Result<Self> {
        let budget = size.resolve()?;
        let files = expand_sources(sources)?;

        let mut schema: Option<SchemaRef> = None;
        let mut layouts = Vec::with_capacity(files.len());
        for path in &files {
            let file = File::open(path).map_err(|e| PrepError::io(path, "open source", e))?;
            let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| {
                PrepError::Parquet {
                    context: format!("reading footer of {}", path.display()),
                    source: Some(Box::new(e)),
                }
            })?;

            let file_schema = builder.schema();
            validate_supported(file_schema, path)?;
            schema = Some(match schema {
                None => unify_schemas(file_schema, file_schema, path)?,
                Some(current) => unify_schemas(&current, file_schema, path)?,
            });

            let row_groups = builder
                .metadata()
                .row_groups()
                .iter()
                .map(|rg| {
                    (
                        rg.num_rows().max(0) as usize,
                        rg.total_byte_size().max(0) as usize,
                    )
                })
                .collect();
            layouts.push(FileLayout {
                path: path.clone(),
                row_groups,
            });
        }

        let schema = schema.ok_or_else(|| PrepError::SourceNotFound {
            sources: sources.to_vec(),
        })?;
        let planned = plan_partitions(&layouts, budget);

        log::info!(
            "Opened {} file(s) as {} partition(s), {} rows (budget {} per partition)",
            files.len(),
            planned.len(),
            planned.iter().map(|p| p.num_rows).sum::<usize>(),
            format_bytes(budget)
        );

        Ok(Self {
            base_schema: schema.clone(),
            schema,
            source: Arc::new(PartitionSource::Files(planned)),
            transforms: Vec::new(),
        })
    }

    /// Wrap in-memory batches, one partition per batch.
    ///
    /// # Errors
    /// - `Validation` if `batches` is empty
    /// - `SchemaMismatch` if batch schemas disagree
    pub fn from_batches(batches: Vec<RecordBatch>) -> Result<Self> {
        let first = batches
            .first()
            .ok_or_else(|| PrepError::validation("Cannot build a dataset from zero batches"))?;
        let origin = PathBuf::from("<memory>");
        let first_schema = first.schema();
        validate_supported(&first_schema, &origin)?;

        let mut schema = unify_schemas(&first_schema, &first_schema, &origin)?;
        for batch in &batches[1..] {
            schema = unify_schemas(&schema, &batch.schema(), &origin)?;
        }
        let batches = batches
            .into_iter()
            .map(|b| Ok(RecordBatch::try_new(schema.clone(), b.columns().to_vec())?))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::from_parts(schema, PartitionSource::Memory(batches)))
    }

    /// Build an in-memory dataset with a known schema. Batches must already
    /// conform to it; an empty list yields a dataset with zero partitions.
    pub fn from_schema_and_batches(schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self> {
        for batch in &batches {
            if batch.schema().fields() != schema.fields() {
                return Err(PrepError::schema_mismatch(
                    "<memory>",
                    "<batch>",
                    format!("{:?}", schema.fields()),
                    format!("{:?}", batch.schema().fields()),
                ));
            }
        }
        Ok(Self::from_parts(schema, PartitionSource::Memory(batches)))
    }

    /// Split a single in-memory table into partitions that fit the budget.
    ///
    /// Row size is estimated from the table's Arrow memory footprint; every
    /// partition holds at least one row.
    pub fn from_table(table: RecordBatch, size: PartitionSize) -> Result<Self> {
        let budget = size.resolve()?;
        let rows = table.num_rows();
        if rows == 0 {
            return Self::from_batches(vec![table]);
        }
        let bytes_per_row = table.get_array_memory_size().div_ceil(rows).max(1);
        let rows_per_partition = (budget / bytes_per_row).max(1);

        let slices: Vec<RecordBatch> = (0..rows)
            .step_by(rows_per_partition)
            .map(|offset| table.slice(offset, rows_per_partition.min(rows - offset)))
            .collect();
        log::debug!(
            "Split {} rows into {} partition(s) of up to {} rows",
            rows,
            slices.len(),
            rows_per_partition
        );
        Self::from_batches(slices)
    }

    /// Reopen a written output directory using its manifest.
    ///
    /// Partitioning and schema come from the manifest; file footers are only
    /// read when partitions are.
    pub fn from_manifest(dir: &Path) -> Result<Self> {
        let manifest = Manifest::load(dir)?;
        let schema = entries_to_schema(&manifest.schema);

        let mut planned: Vec<PlannedPartition> = Vec::new();
        let mut current_partition: Option<usize> = None;
        for entry in &manifest.files {
            let piece = FilePiece {
                path: dir.join(&entry.path),
                row_groups: None,
            };
            match planned.last_mut() {
                Some(last) if current_partition == Some(entry.partition) => {
                    last.pieces.push(piece);
                    last.num_rows += entry.num_rows as usize;
                    last.byte_size += entry.num_bytes as usize;
                }
                _ => planned.push(PlannedPartition {
                    pieces: vec![piece],
                    num_rows: entry.num_rows as usize,
                    byte_size: entry.num_bytes as usize,
                }),
            }
            current_partition = Some(entry.partition);
        }

        Ok(Self::from_parts(schema, PartitionSource::Files(planned)))
    }

    fn from_parts(schema: SchemaRef, source: PartitionSource) -> Self {
        Self {
            base_schema: schema.clone(),
            schema,
            source: Arc::new(source),
            transforms: Vec::new(),
        }
    }

    /// Return a new dataset whose partitions pass through `transform`.
    ///
    /// # Errors
    /// `Validation` if the transform was built for a different schema.
    pub fn with_transform(&self, transform: Arc<dyn ColumnTransform>) -> Result<Self> {
        if transform.input_schema().fields() != self.schema.fields() {
            return Err(PrepError::validation(format!(
                "Transform '{}' was built for a different schema than this dataset",
                transform.name()
            )));
        }
        let mut transforms = self.transforms.clone();
        let schema = transform.output_schema().clone();
        transforms.push(transform);
        Ok(Self {
            base_schema: self.base_schema.clone(),
            schema,
            source: self.source.clone(),
            transforms,
        })
    }

    /// Schema every partition conforms to (after attached transforms).
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn num_partitions(&self) -> usize {
        match self.source.as_ref() {
            PartitionSource::Files(parts) => parts.len(),
            PartitionSource::Memory(batches) => batches.len(),
        }
    }

    /// Rows in partition `index`, from metadata.
    pub fn partition_rows(&self, index: usize) -> Option<usize> {
        match self.source.as_ref() {
            PartitionSource::Files(parts) => parts.get(index).map(|p| p.num_rows),
            PartitionSource::Memory(batches) => batches.get(index).map(|b| b.num_rows()),
        }
    }

    /// Total rows, from metadata. Valid after transforms since every
    /// transform preserves row count.
    pub fn total_rows(&self) -> usize {
        (0..self.num_partitions())
            .filter_map(|i| self.partition_rows(i))
            .sum()
    }

    /// Names of attached transforms, in application order.
    pub fn transform_names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    /// Planned file partitions, or `None` for in-memory datasets.
    pub fn planned_partitions(&self) -> Option<&[PlannedPartition]> {
        match self.source.as_ref() {
            PartitionSource::Files(parts) => Some(parts),
            PartitionSource::Memory(_) => None,
        }
    }

    /// Read partition `index` and apply every attached transform.
    pub fn read_partition(&self, index: usize) -> Result<Partition> {
        let mut batch = match self.source.as_ref() {
            PartitionSource::Memory(batches) => batches
                .get(index)
                .cloned()
                .ok_or_else(|| partition_out_of_range(index, batches.len()))?,
            PartitionSource::Files(parts) => {
                let planned = parts
                    .get(index)
                    .ok_or_else(|| partition_out_of_range(index, parts.len()))?;
                read_planned(planned, &self.base_schema)?
            }
        };

        for transform in &self.transforms {
            batch = transform.apply(&batch)?;
        }
        Ok(Partition::new(index, batch))
    }

    /// Lazy sequence of partitions. Each call starts a fresh sequence.
    pub fn partitions(&self) -> Partitions<'_> {
        Partitions {
            dataset: self,
            next: 0,
        }
    }

    /// Read every partition into memory, in order.
    pub fn collect_batches(&self) -> Result<Vec<RecordBatch>> {
        self.partitions().map(|p| p.map(Partition::into_batch)).collect()
    }
}

/// Iterator over a dataset's partitions.
pub struct Partitions<'a> {
    dataset: &'a Dataset,
    next: usize,
}

impl Iterator for Partitions<'_> {
    type Item = Result<Partition>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.dataset.num_partitions() {
            return None;
        }
        let partition = self.dataset.read_partition(self.next);
        self.next += 1;
        Some(partition)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.dataset.num_partitions().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

fn partition_out_of_range(index: usize, count: usize) -> PrepError {
    PrepError::validation(format!(
        "Partition {} out of range (dataset has {})",
        index, count
    ))
}

/// Expand files and directories into the list of Parquet files to read.
fn expand_sources(sources: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for source in sources {
        if source.is_dir() {
            let entries =
                fs::read_dir(source).map_err(|e| PrepError::io(source, "list directory", e))?;
            let mut found: Vec<PathBuf> = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| PrepError::io(source, "list directory", e))?;
                let path = entry.path();
                if path.is_file() && is_data_file(&path) {
                    found.push(path);
                }
            }
            found.sort();
            if found.is_empty() {
                log::warn!("No Parquet files in directory {}", source.display());
            }
            files.extend(found);
        } else if source.is_file() {
            files.push(source.clone());
        } else {
            return Err(PrepError::SourceNotFound {
                sources: vec![source.clone()],
            });
        }
    }

    if files.is_empty() {
        return Err(PrepError::SourceNotFound {
            sources: sources.to_vec(),
        });
    }
    Ok(files)
}

fn is_data_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') || n.starts_with('_'))
        .unwrap_or(true);
    let parquet = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("parquet"))
        .unwrap_or(false);
    parquet && !hidden
}

/// Group row groups into partitions under a byte budget.
///
/// Row groups stay in file order and partitions never span files. A row
/// group larger than the budget is emitted alone rather than split.
pub fn plan_partitions(layouts: &[FileLayout], budget: usize) -> Vec<PlannedPartition> {
    let mut planned = Vec::new();

    for layout in layouts {
        if layout.row_groups.is_empty() {
            log::debug!("Skipping {} (no row groups)", layout.path.display());
            continue;
        }

        let mut current: Vec<usize> = Vec::new();
        let mut rows = 0usize;
        let mut bytes = 0usize;

        for (rg_idx, &(rg_rows, rg_bytes)) in layout.row_groups.iter().enumerate() {
            if !current.is_empty() && bytes.saturating_add(rg_bytes) > budget {
                planned.push(PlannedPartition {
                    pieces: vec![FilePiece {
                        path: layout.path.clone(),
                        row_groups: Some(std::mem::take(&mut current)),
                    }],
                    num_rows: rows,
                    byte_size: bytes,
                });
                rows = 0;
                bytes = 0;
            }
            if rg_bytes > budget {
                log::debug!(
                    "Row group {} of {} is {} (over the {} budget); emitting oversized partition",
                    rg_idx,
                    layout.path.display(),
                    format_bytes(rg_bytes),
                    format_bytes(budget)
                );
            }
            current.push(rg_idx);
            rows += rg_rows;
            bytes = bytes.saturating_add(rg_bytes);
        }

        planned.push(PlannedPartition {
            pieces: vec![FilePiece {
                path: layout.path.clone(),
                row_groups: Some(current),
            }],
            num_rows: rows,
            byte_size: bytes,
        });
    }

    planned
}

/// Read one planned partition and conform it to `schema`.
fn read_planned(planned: &PlannedPartition, schema: &SchemaRef) -> Result<RecordBatch> {
    let mut batches = Vec::new();
    for piece in &planned.pieces {
        let file =
            File::open(&piece.path).map_err(|e| PrepError::io(&piece.path, "open partition", e))?;
        let mut builder =
            ParquetRecordBatchReaderBuilder::try_new(file)?.with_batch_size(READ_BATCH_SIZE);
        if let Some(row_groups) = &piece.row_groups {
            builder = builder.with_row_groups(row_groups.clone());
        }
        let reader = builder.build()?;
        for batch in reader {
            let batch = batch?;
            batches.push(RecordBatch::try_new(schema.clone(), batch.columns().to_vec())?);
        }
    }

    if batches.is_empty() {
        return Ok(RecordBatch::new_empty(schema.clone()));
    }
    if batches.len() == 1 {
        return Ok(batches.swap_remove(0));
    }
    Ok(concat_batches(schema, &batches)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Float64Array, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use parquet::arrow::ArrowWriter;
    use parquet::file::properties::WriterProperties;
    use tempfile::TempDir;

    fn int_batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    fn write_parquet(path: &Path, batch: &RecordBatch, row_group_size: usize) {
        let props = WriterProperties::builder()
            .set_max_row_group_size(row_group_size)
            .build();
        let file = File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).unwrap();
        writer.write(batch).unwrap();
        writer.close().unwrap();
    }

    fn layout(name: &str, groups: &[(usize, usize)]) -> FileLayout {
        FileLayout {
            path: PathBuf::from(name),
            row_groups: groups.to_vec(),
        }
    }

    #[test]
    fn test_plan_packs_row_groups_under_budget() {
        let layouts = vec![layout("a.parquet", &[(10, 40), (10, 40), (10, 40)])];
        let planned = plan_partitions(&layouts, 100);
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].pieces[0].row_groups, Some(vec![0, 1]));
        assert_eq!(planned[1].pieces[0].row_groups, Some(vec![2]));
        assert_eq!(planned[0].num_rows + planned[1].num_rows, 30);
    }

    #[test]
    fn test_plan_emits_oversized_row_group_alone() {
        let layouts = vec![layout("a.parquet", &[(5, 10), (100, 500), (5, 10)])];
        let planned = plan_partitions(&layouts, 100);
        assert_eq!(planned.len(), 3);
        assert_eq!(planned[1].pieces[0].row_groups, Some(vec![1]));
        assert_eq!(planned[1].byte_size, 500);
    }

    #[test]
    fn test_plan_never_spans_files() {
        let layouts = vec![
            layout("a.parquet", &[(1, 1)]),
            layout("b.parquet", &[(1, 1)]),
        ];
        let planned = plan_partitions(&layouts, 1_000_000);
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[1].pieces[0].path, PathBuf::from("b.parquet"));
    }

    #[test]
    fn test_from_batches_rejects_mismatched_schema() {
        let a = int_batch(vec![1, 2]);
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Float64, false)]));
        let b = RecordBatch::try_new(schema, vec![Arc::new(Float64Array::from(vec![1.0]))])
            .unwrap();
        assert!(matches!(
            Dataset::from_batches(vec![a, b]),
            Err(PrepError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_partitions_is_restartable() {
        let ds = Dataset::from_batches(vec![int_batch(vec![1, 2]), int_batch(vec![3])]).unwrap();
        let first: Vec<usize> = ds.partitions().map(|p| p.unwrap().num_rows()).collect();
        let second: Vec<usize> = ds.partitions().map(|p| p.unwrap().num_rows()).collect();
        assert_eq!(first, vec![2, 1]);
        assert_eq!(first, second);
        assert_eq!(ds.total_rows(), 3);
    }

    #[test]
    fn test_from_table_respects_budget() {
        let table = int_batch((0..1000).collect());
        let bytes_per_row = table.get_array_memory_size().div_ceil(1000);
        let ds = Dataset::from_table(table, PartitionSize::Bytes(bytes_per_row * 100)).unwrap();
        assert_eq!(ds.num_partitions(), 10);
        assert_eq!(ds.total_rows(), 1000);
    }

    #[test]
    fn test_open_directory_and_read_back() {
        let tmp = TempDir::new().unwrap();
        write_parquet(&tmp.path().join("a.parquet"), &int_batch((0..50).collect()), 10);
        write_parquet(&tmp.path().join("b.parquet"), &int_batch((50..100).collect()), 10);
        std::fs::write(tmp.path().join("_SUCCESS"), "").unwrap();

        let ds = Dataset::open(&[tmp.path().to_path_buf()], PartitionSize::Bytes(1)).unwrap();
        // Budget of one byte: every row group is oversized and stands alone.
        assert_eq!(ds.num_partitions(), 10);
        assert_eq!(ds.total_rows(), 100);

        let mut values = Vec::new();
        for partition in ds.partitions() {
            let batch = partition.unwrap().into_batch();
            let col = batch.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
            values.extend(col.values().iter().copied());
        }
        assert_eq!(values, (0..100).collect::<Vec<i64>>());
    }

    #[test]
    fn test_open_detects_schema_mismatch() {
        let tmp = TempDir::new().unwrap();
        write_parquet(&tmp.path().join("a.parquet"), &int_batch(vec![1]), 10);
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Utf8, true)]));
        let strings =
            RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(vec!["one"]))]).unwrap();
        write_parquet(&tmp.path().join("b.parquet"), &strings, 10);

        let err = Dataset::open(&[tmp.path().to_path_buf()], PartitionSize::default()).unwrap_err();
        match err {
            PrepError::SchemaMismatch { path, column, .. } => {
                assert!(path.ends_with("b.parquet"));
                assert_eq!(column, "x");
            }
            other => panic!("Expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_open_missing_source() {
        let tmp = TempDir::new().unwrap();
        let err = Dataset::open(&[tmp.path().join("nope.parquet")], PartitionSize::default())
            .unwrap_err();
        assert!(matches!(err, PrepError::SourceNotFound { .. }));

        let empty_dir = tmp.path().join("empty");
        std::fs::create_dir(&empty_dir).unwrap();
        let err = Dataset::open(&[empty_dir], PartitionSize::default()).unwrap_err();
        assert!(matches!(err, PrepError::SourceNotFound { .. }));
    }

    #[test]
    fn test_nullable_union_across_files() {
        let tmp = TempDir::new().unwrap();
        write_parquet(&tmp.path().join("a.parquet"), &int_batch(vec![1, 2]), 10);
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, true)]));
        let with_null = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![Some(3), None]))],
        )
        .unwrap();
        write_parquet(&tmp.path().join("b.parquet"), &with_null, 10);

        let ds = Dataset::open(&[tmp.path().to_path_buf()], PartitionSize::default()).unwrap();
        assert!(ds.schema().field(0).is_nullable());
        let last = ds.read_partition(1).unwrap();
        assert_eq!(last.batch().column(0).null_count(), 1);
    }
}
