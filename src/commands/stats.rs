//! `tabprep stats`: global column statistics.

use anyhow::{Context, Result};
use std::path::PathBuf;

use tabprep::{Dataset, ParallelExecutor, PartitionSize, Statistic, StatisticsCollector};

use super::helpers::format_value;

pub fn print_statistics(
    inputs: &[PathBuf],
    columns: &[String],
    quantiles: &[f64],
    partition_size: usize,
) -> Result<()> {
    let dataset = Dataset::open(inputs, PartitionSize::Bytes(partition_size))
        .context("Failed to open input dataset")?;

    let mut requested = vec![0.5];
    requested.extend(quantiles.iter().copied().filter(|&q| q != 0.5));
    let statistics = StatisticsCollector::new(
        columns.iter().cloned(),
        Statistic::all_with_quantiles(&requested),
    )
    .allow_empty_fallback(true)
    .collect(&dataset, &ParallelExecutor::new())
    .context("Failed to collect statistics")?;

    println!(
        "{} rows in {} partition(s)",
        dataset.total_rows(),
        dataset.num_partitions()
    );
    for column in columns {
        let stats = statistics.require(column)?;
        println!("\n{}", column);
        println!("  count       {}", stats.count);
        println!("  null_count  {}", stats.null_count);
        if stats.fallback {
            println!("  (no values; defaults shown)");
        }
        println!("  mean        {}", format_value(stats.mean));
        println!("  std         {}", format_value(stats.std));
        println!("  min         {}", format_value(stats.min));
        println!("  max         {}", format_value(stats.max));
        for (p, v) in &stats.quantiles {
            println!("  q{:<10} {}", p, format_value(*v));
        }
    }
    Ok(())
}
