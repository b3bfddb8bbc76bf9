//! Config file to written output, through the library API.

use anyhow::Result;
use std::fs;
use tabprep::config::{parse_config, validate_config};
use tabprep::{generate, Dataset, GenerateOptions, PrepError, Stage};
use tempfile::tempdir;

#[test]
fn test_config_drives_pipeline() -> Result<()> {
    let dir = tempdir()?;
    generate(
        &dir.path().join("data"),
        &GenerateOptions {
            rows: 400,
            files: 2,
            seed: 8,
            null_fraction: 0.0,
        },
    )?;
    let config_path = dir.path().join("pipeline.toml");
    fs::write(
        &config_path,
        r#"
[input]
paths = ["data"]
partition_size_fraction = 0.5

[categorify]
columns = ["region"]
cache = "disk"
cache_path = "cache"

[shuffle]
mode = "key"
key = ["region"]

[output]
path = "out"
files_per_partition = 2
compression = "zstd"
"#,
    )?;

    let config = parse_config(&config_path)?;
    validate_config(&config, dir.path())?;

    let input = Dataset::open(
        &config.input_paths(dir.path()),
        config.partition_size()?,
    )?;
    assert_eq!(input.num_partitions(), 2);

    let pipeline = config.build_pipeline(dir.path(), input.num_partitions())?;
    assert!(matches!(pipeline.stages()[1], Stage::Shuffle(ref s) if s.num_partitions == 2));

    let executor = config.executor()?;
    let (output, manifest) = pipeline.run_and_write(
        input,
        &config.output_path(dir.path()),
        config.write_options(),
        &executor,
    )?;
    assert_eq!(manifest.total_rows, 400);
    assert_eq!(output.dictionary.unwrap().column("region").unwrap().len(), 4);
    assert!(dir.path().join("cache").join("categories.toml").exists());
    assert!(dir.path().join("out").join("categories").is_dir());
    Ok(())
}

#[test]
fn test_missing_input_reported() -> Result<()> {
    let dir = tempdir()?;
    let config_path = dir.path().join("pipeline.toml");
    fs::write(
        &config_path,
        "[input]\npaths = [\"absent\"]\npartition_size = \"8M\"\n[output]\npath = \"out\"\n",
    )?;
    let config = parse_config(&config_path)?;
    let err = validate_config(&config, dir.path()).unwrap_err();
    assert!(matches!(err, PrepError::SourceNotFound { .. }));
    Ok(())
}
