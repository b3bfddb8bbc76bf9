//! Command-line argument definitions for the tabprep CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::helpers::{parse_fraction_arg, parse_partition_size_arg, parse_quantile_arg};

#[derive(Parser)]
#[command(name = "tabprep")]
#[command(about = "Partitioned preprocessing for columnar tables")]
#[command(
    long_about = "tabprep: statistics, missing-value fill, normalization, categorical encoding and shuffling over partitioned Parquet data.

WORKFLOW:
  1. Describe a pipeline in TOML:  pipeline.toml
  2. Run it:                       tabprep run -c pipeline.toml
  3. Inspect the output:           tabprep inspect -m out/

OUTPUT:
  A directory with manifest.toml, part.<partition>.<file>.parquet files and,
  when the pipeline categorifies, a categories/ dictionary directory."
)]
#[command(after_help = "EXAMPLES:
  # Write a synthetic dataset to try things with
  tabprep generate -o data/ --rows 100000 --files 8 --seed 1 --null-fraction 0.05

  # Global statistics for two columns
  tabprep stats -i data/ -c x -c count -q 0.5 -q 0.9

  # Run a configured pipeline with progress output
  tabprep -v run -c pipeline.toml")]
pub struct Cli {
    /// Enable verbose progress output with timestamps
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline described by a TOML config file
    #[command(after_help = "EXAMPLES:
  tabprep run -c pipeline.toml
  tabprep run -c pipeline.toml --threads 4")]
    Run {
        /// Pipeline config file. Relative paths inside it resolve against
        /// the file's directory.
        #[arg(short, long)]
        config: PathBuf,

        /// Worker threads (overrides [execution] threads; 0 = all cores)
        #[arg(short, long)]
        threads: Option<usize>,
    },

    /// Write a synthetic mixed-type dataset
    Generate {
        /// Output directory (created if missing)
        #[arg(short, long)]
        output: PathBuf,

        /// Total rows across all files
        #[arg(long, default_value_t = 10_000)]
        rows: usize,

        /// Number of Parquet files
        #[arg(long, default_value_t = 4)]
        files: usize,

        /// Random seed; the same seed gives identical files
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Probability that a nullable cell is null, in [0, 1]
        #[arg(long, default_value = "0", value_parser = parse_fraction_arg)]
        null_fraction: f64,
    },

    /// Print global statistics for columns of a dataset
    #[command(after_help = "EXAMPLES:
  tabprep stats -i data/ -c x
  tabprep stats -i a.parquet -i b.parquet -c x -c count -q 0.25 -q 0.75")]
    Stats {
        /// Parquet files or directories. Can specify multiple times.
        #[arg(short, long, required = true)]
        input: Vec<PathBuf>,

        /// Columns to summarize. Can specify multiple times.
        #[arg(short, long, required = true)]
        column: Vec<String>,

        /// Extra quantiles to report, in [0, 1]. The median is always shown.
        #[arg(short, long, value_parser = parse_quantile_arg)]
        quantile: Vec<f64>,

        /// Partition byte budget (e.g. 64M, 1G)
        #[arg(long, default_value = "256M", value_parser = parse_partition_size_arg)]
        partition_size: usize,
    },

    /// Summarize an output directory written by `run`
    Inspect {
        /// Output directory containing manifest.toml
        #[arg(short, long)]
        manifest: PathBuf,
    },
}
