//! `tabprep run`: execute a configured pipeline.

use anyhow::{Context, Result};
use std::path::Path;

use tabprep::config::{parse_config, validate_config};
use tabprep::memory::format_bytes;
use tabprep::{Dataset, ParallelExecutor, PipelineOutput};

use super::helpers::format_value;

pub fn run_pipeline(config_path: &Path, threads: Option<usize>) -> Result<()> {
    let config = parse_config(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    validate_config(&config, config_dir).context("Invalid pipeline config")?;

    let input = Dataset::open(&config.input_paths(config_dir), config.partition_size()?)
        .context("Failed to open input dataset")?;
    log::info!(
        "Input: {} rows in {} partition(s)",
        input.total_rows(),
        input.num_partitions()
    );

    let pipeline = config.build_pipeline(config_dir, input.num_partitions())?;
    let executor = match threads {
        Some(n) => ParallelExecutor::with_threads(n)?.max_retries(config.execution.max_retries),
        None => config.executor()?,
    };

    let output_dir = config.output_path(config_dir);
    let (output, manifest) = pipeline
        .run_and_write(input, &output_dir, config.write_options(), &executor)
        .with_context(|| format!("Pipeline failed writing to {}", output_dir.display()))?;

    print_summary(&output);
    println!(
        "Wrote {} rows in {} file(s) ({}) to {}",
        manifest.total_rows,
        manifest.files.len(),
        format_bytes(manifest.total_bytes() as usize),
        output_dir.display()
    );
    Ok(())
}

fn print_summary(output: &PipelineOutput) {
    if !output.statistics.is_empty() {
        println!("Statistics:");
        for (name, stats) in output.statistics.iter() {
            println!(
                "  {}: count={} nulls={} mean={} std={}",
                name,
                stats.count,
                stats.null_count,
                format_value(stats.mean),
                format_value(stats.std)
            );
        }
    }
    if let Some(dictionary) = &output.dictionary {
        println!("Categories:");
        for column in dictionary.encoded_columns() {
            if let Some(dict) = dictionary.column(&column) {
                println!("  {}: {} value(s)", column, dict.len());
            }
        }
    }
    if let Some(report) = &output.shuffle {
        println!(
            "Shuffle: {} -> {} partition(s), {} of {} rows moved in {:.2?}",
            report.input_partitions,
            report.output_partitions,
            report.rows_moved,
            report.total_rows,
            report.elapsed
        );
    }
}
