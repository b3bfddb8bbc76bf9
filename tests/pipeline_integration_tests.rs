//! End-to-end pipeline tests over Parquet input files.

use anyhow::Result;
use arrow::array::{Array, Float64Array, Int64Array, StringArray, UInt32Array};
use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tabprep::{
    generate, CategoryDictionary, ComboColumn, Dataset, FillStrategy, GenerateOptions,
    ParallelExecutor, PartitionSize, Pipeline, PrepError, SequentialExecutor, ShuffleSpec,
    Statistic, StatisticsCollector, WriteOptions,
};
use tempfile::tempdir;

fn write_x_file(path: &Path, xs: std::ops::Range<i64>) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![Arc::new(Int64Array::from_iter_values(xs))],
    )?;
    let mut writer = ArrowWriter::try_new(File::create(path)?, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn float_column(batch: &RecordBatch, name: &str) -> Vec<f64> {
    let idx = batch.schema().index_of(name).unwrap();
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Float64Array>()
        .unwrap()
        .values()
        .to_vec()
}

/// Two files of 100 rows, x = 0..199: mean 99.5, std about 57.73, and the
/// first normalized value about -1.723.
#[test]
fn test_normalize_two_files_end_to_end() -> Result<()> {
    let dir = tempdir()?;
    let input = dir.path().join("input");
    std::fs::create_dir(&input)?;
    write_x_file(&input.join("a.parquet"), 0..100)?;
    write_x_file(&input.join("b.parquet"), 100..200)?;

    let dataset = Dataset::open(&[input], PartitionSize::Bytes(1))?;
    assert_eq!(dataset.num_partitions(), 2);
    assert_eq!(dataset.total_rows(), 200);

    let pipeline = Pipeline::builder().normalize(vec!["x".into()]).build()?;
    let out_dir = dir.path().join("out");
    let (output, manifest) = pipeline.run_and_write(
        dataset,
        &out_dir,
        WriteOptions::default(),
        &ParallelExecutor::new(),
    )?;

    let stats = output.statistics.require("x")?;
    assert!((stats.mean - 99.5).abs() < 1e-9);
    assert!((stats.std - 57.73).abs() < 1e-2, "std = {}", stats.std);

    assert_eq!(manifest.total_rows, 200);
    let written = Dataset::from_manifest(&out_dir)?;
    let batches = written.collect_batches()?;
    let values: Vec<f64> = batches.iter().flat_map(|b| float_column(b, "x")).collect();
    assert_eq!(values.len(), 200);
    assert!((values[0] - (-1.723)).abs() < 1e-3, "first = {}", values[0]);
    assert!((values[199] - 1.723).abs() < 1e-3);

    let mean: f64 = values.iter().sum::<f64>() / values.len() as f64;
    assert!(mean.abs() < 1e-9);
    Ok(())
}

#[test]
fn test_statistics_partition_count_invariance() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("data");
    generate(
        &path,
        &GenerateOptions {
            rows: 3000,
            files: 6,
            seed: 9,
            null_fraction: 0.1,
        },
    )?;

    let collector = StatisticsCollector::new(
        ["x", "count"],
        Statistic::all_with_quantiles(&[0.5]),
    )
    .quantile_epsilon(0.0001);

    let many = Dataset::open(&[path], PartitionSize::Bytes(1))?;
    assert_eq!(many.num_partitions(), 6);
    let whole = concat_batches(&many.schema(), &many.collect_batches()?)?;
    let one = Dataset::from_batches(vec![whole])?;
    assert_eq!(one.num_partitions(), 1);

    let a = collector.collect(&one, &SequentialExecutor::new())?;
    let b = collector.collect(&many, &ParallelExecutor::new())?;
    for column in ["x", "count"] {
        let (a, b) = (a.require(column)?, b.require(column)?);
        assert_eq!(a.count, b.count);
        assert_eq!(a.null_count, b.null_count);
        assert_eq!(a.min, b.min);
        assert_eq!(a.max, b.max);
        assert!((a.mean - b.mean).abs() < 1e-9);
        assert!((a.std - b.std).abs() < 1e-9);
        assert!((a.median().unwrap() - b.median().unwrap()).abs() < 1e-9);
    }
    Ok(())
}

#[test]
fn test_fill_normalize_categorify_generated_data() -> Result<()> {
    let dir = tempdir()?;
    let data = dir.path().join("data");
    generate(
        &data,
        &GenerateOptions {
            rows: 2000,
            files: 4,
            seed: 3,
            null_fraction: 0.2,
        },
    )?;

    let pipeline = Pipeline::builder()
        .fill_missing(vec!["x".into()], FillStrategy::Median)
        .normalize(vec!["x".into()])
        .categorify(
            vec!["cat".into(), "region".into()],
            vec![ComboColumn::new(["cat", "region"])],
        )
        .build()?;

    let dataset = Dataset::open(&[data], PartitionSize::Bytes(1))?;
    let out_dir = dir.path().join("out");
    let (output, manifest) = pipeline.run_and_write(
        dataset,
        &out_dir,
        WriteOptions::default(),
        &ParallelExecutor::new(),
    )?;
    assert_eq!(manifest.total_rows, 2000);

    let dictionary = output.dictionary.expect("categorify ran");
    let saved = CategoryDictionary::load(&out_dir.join("categories"))?;
    assert_eq!(&saved, dictionary.as_ref());

    let written = Dataset::from_manifest(&out_dir)?;
    let schema = written.schema();
    assert!(schema.index_of("cat_region").is_ok());
    assert!(!schema.field_with_name("x")?.is_nullable());

    let cat_len = dictionary.column("cat").unwrap().len() as u32;
    let combo_len = dictionary.column("cat_region").unwrap().len() as u32;
    let mut sum = 0.0;
    let mut rows = 0usize;
    for batch in written.collect_batches()? {
        let x = float_column(&batch, "x");
        sum += x.iter().sum::<f64>();
        rows += x.len();

        let cats = batch
            .column(schema.index_of("cat")?)
            .as_any()
            .downcast_ref::<UInt32Array>()
            .unwrap();
        assert_eq!(cats.null_count(), 0);
        assert!(cats.values().iter().all(|&c| c <= cat_len));

        let combos = batch
            .column(schema.index_of("cat_region")?)
            .as_any()
            .downcast_ref::<UInt32Array>()
            .unwrap();
        assert!(combos.values().iter().all(|&c| c <= combo_len));
    }
    assert_eq!(rows, 2000);
    assert!((sum / rows as f64).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_dictionary_is_deterministic_across_partitioning() -> Result<()> {
    let schema = Arc::new(Schema::new(vec![Field::new("c", DataType::Utf8, true)]));
    let values = vec![
        Some("x"),
        Some("y"),
        None,
        Some("y"),
        Some("z"),
        Some("y"),
        Some("x"),
    ];
    let whole = RecordBatch::try_new(
        schema.clone(),
        vec![Arc::new(StringArray::from(values.clone()))],
    )?;
    let parts: Vec<RecordBatch> = values
        .chunks(2)
        .map(|chunk| {
            RecordBatch::try_new(
                schema.clone(),
                vec![Arc::new(StringArray::from(chunk.to_vec()))],
            )
        })
        .collect::<Result<_, _>>()?;

    let pipeline = Pipeline::builder()
        .categorify(vec!["c".into()], vec![])
        .build()?;
    let a = pipeline.run(Dataset::from_batches(vec![whole])?, &SequentialExecutor::new())?;
    let b = pipeline.run(Dataset::from_batches(parts)?, &ParallelExecutor::new())?;

    let (a, b) = (a.dictionary.unwrap(), b.dictionary.unwrap());
    assert_eq!(a, b);
    // Most frequent first, ties by value.
    assert_eq!(a.column("c").unwrap().values(), &["y", "x", "z"]);
    assert_eq!(a.encode("c", "y")?, 1);
    assert_eq!(a.encode("c", "never-seen")?, 0);
    Ok(())
}

#[test]
fn test_shuffled_output_cannot_replace_its_input() -> Result<()> {
    let dir = tempdir()?;
    let input = dir.path().join("input");
    std::fs::create_dir(&input)?;
    let a = input.join("a.parquet");
    write_x_file(&a, 0..100)?;

    let pipeline = Pipeline::builder()
        .shuffle(ShuffleSpec::random(5, 2))
        .build()?;
    let options = WriteOptions {
        overwrite: true,
        ..Default::default()
    };
    let err = pipeline
        .run_and_write(
            Dataset::open(&[input.clone()], PartitionSize::Bytes(1))?,
            &input,
            options,
            &ParallelExecutor::new(),
        )
        .unwrap_err();
    assert!(matches!(err, PrepError::Validation(_)), "got {:?}", err);
    assert!(a.exists());
    assert_eq!(Dataset::open(&[input], PartitionSize::Bytes(1))?.total_rows(), 100);
    Ok(())
}
