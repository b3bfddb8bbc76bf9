//! Synthetic input data.
//!
//! Writes a small mixed-type table split across Parquet files, for trying
//! pipelines and for tests. Output is fully determined by the seed.
//!
//! Columns:
//! - `id` (Int64): global row number, never null
//! - `x` (Float64): uniform in [0, 100), nullable
//! - `count` (Int64): uniform in [0, 1000), nullable
//! - `cat` (Utf8): one of eight labels with a skewed distribution, nullable
//! - `region` (Utf8): one of four labels, never null

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{PrepError, Result};
use crate::writer::{split_rows, ParquetWriteOptions, PartitionFileWriter};

const CATEGORIES: [&str; 8] = ["a", "b", "c", "d", "e", "f", "g", "h"];
const REGIONS: [&str; 4] = ["north", "south", "east", "west"];

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    pub rows: usize,
    pub files: usize,
    pub seed: u64,
    /// Probability that a nullable cell is null.
    pub null_fraction: f64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            rows: 10_000,
            files: 4,
            seed: 0,
            null_fraction: 0.0,
        }
    }
}

impl GenerateOptions {
    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 {
            return Err(PrepError::validation("rows must be > 0"));
        }
        if self.files == 0 {
            return Err(PrepError::validation("files must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.null_fraction) {
            return Err(PrepError::validation(format!(
                "null_fraction must be in [0, 1], got {}",
                self.null_fraction
            )));
        }
        Ok(())
    }
}

pub fn synthetic_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("x", DataType::Float64, true),
        Field::new("count", DataType::Int64, true),
        Field::new("cat", DataType::Utf8, true),
        Field::new("region", DataType::Utf8, false),
    ]))
}

/// Build rows `offset..offset + rows` of the synthetic table.
pub fn synthetic_batch(
    offset: usize,
    rows: usize,
    seed: u64,
    null_fraction: f64,
) -> Result<RecordBatch> {
    let mut rng = StdRng::seed_from_u64(seed ^ (offset as u64).rotate_left(32));

    let ids: Vec<i64> = (offset..offset + rows).map(|i| i as i64).collect();
    let mut xs = Vec::with_capacity(rows);
    let mut counts = Vec::with_capacity(rows);
    let mut cats = Vec::with_capacity(rows);
    let mut regions = Vec::with_capacity(rows);

    for _ in 0..rows {
        xs.push((!rng.gen_bool(null_fraction)).then(|| rng.gen_range(0.0..100.0)));
        counts.push((!rng.gen_bool(null_fraction)).then(|| rng.gen_range(0..1000i64)));
        // Squaring a uniform draw skews toward the first labels.
        let u: f64 = rng.gen();
        let cat = CATEGORIES[((u * u) * CATEGORIES.len() as f64) as usize];
        cats.push((!rng.gen_bool(null_fraction)).then_some(cat));
        regions.push(REGIONS[rng.gen_range(0..REGIONS.len())]);
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(ids)),
        Arc::new(Float64Array::from(xs)),
        Arc::new(Int64Array::from(counts)),
        Arc::new(StringArray::from(cats)),
        Arc::new(StringArray::from(regions)),
    ];
    Ok(RecordBatch::try_new(synthetic_schema(), columns)?)
}

/// Write `options.rows` synthetic rows into `options.files` files in `dir`.
///
/// `dir` is created if needed and must not already hold Parquet files.
pub fn generate(dir: &Path, options: &GenerateOptions) -> Result<Vec<PathBuf>> {
    options.validate()?;

    if dir.exists() {
        let entries = fs::read_dir(dir).map_err(|e| PrepError::io(dir, "read directory", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| PrepError::io(dir, "read directory", e))?;
            if entry.path().extension().is_some_and(|ext| ext == "parquet") {
                return Err(PrepError::OutputExists {
                    path: dir.to_path_buf(),
                });
            }
        }
    } else {
        fs::create_dir_all(dir).map_err(|e| PrepError::io(dir, "create directory", e))?;
    }

    let props = ParquetWriteOptions::default().to_writer_properties()?;
    let schema = synthetic_schema();
    let mut written = Vec::with_capacity(options.files);

    for (i, (offset, rows)) in split_rows(options.rows, options.files).into_iter().enumerate() {
        let batch = synthetic_batch(offset, rows, options.seed, options.null_fraction)?;
        let name = format!("data.{:03}.parquet", i);
        let mut writer = PartitionFileWriter::create(dir, &name, schema.clone(), props.clone())?;
        writer.write(&batch)?;
        let (path, _, bytes) = writer.commit()?;
        log::debug!("Wrote {} ({} rows, {} bytes)", path.display(), rows, bytes);
        written.push(path);
    }

    log::info!(
        "Generated {} rows in {} file(s) under {}",
        options.rows,
        written.len(),
        dir.display()
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::memory::PartitionSize;
    use arrow::array::Array;
    use tempfile::TempDir;

    #[test]
    fn test_batch_is_deterministic() {
        let a = synthetic_batch(0, 100, 7, 0.2).unwrap();
        let b = synthetic_batch(0, 100, 7, 0.2).unwrap();
        let c = synthetic_batch(0, 100, 8, 0.2).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_null_fraction_bounds() {
        let none = synthetic_batch(0, 500, 1, 0.0).unwrap();
        assert_eq!(none.column(1).null_count(), 0);

        let all = synthetic_batch(0, 50, 1, 1.0).unwrap();
        assert_eq!(all.column(1).null_count(), 50);
        assert_eq!(all.column(4).null_count(), 0);

        assert!(GenerateOptions {
            null_fraction: 1.5,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_generate_files_readable() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("data");
        let options = GenerateOptions {
            rows: 1001,
            files: 3,
            seed: 42,
            null_fraction: 0.1,
        };
        let paths = generate(&dir, &options).unwrap();
        assert_eq!(paths.len(), 3);

        let ds = Dataset::open(&[dir.clone()], PartitionSize::Bytes(1 << 30)).unwrap();
        assert_eq!(ds.total_rows(), 1001);
        assert_eq!(ds.schema().fields().len(), 5);

        assert!(matches!(
            generate(&dir, &options),
            Err(PrepError::OutputExists { .. })
        ));
    }
}
