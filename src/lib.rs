//! tabprep: partitioned preprocessing for columnar tables.
//!
//! A [`Dataset`] is a lazily read, partitioned table. A [`Pipeline`] runs
//! global statistics, missing-value fill, normalization, categorical
//! encoding and shuffling over it, and a [`Writer`] persists the result as
//! a directory of Parquet files with a manifest.
//!
//! ```no_run
//! use tabprep::{Dataset, FillStrategy, ParallelExecutor, PartitionSize, Pipeline, WriteOptions};
//! use std::path::{Path, PathBuf};
//!
//! # fn main() -> tabprep::Result<()> {
//! let input = Dataset::open(&[PathBuf::from("data/")], PartitionSize::default())?;
//! let pipeline = Pipeline::builder()
//!     .fill_missing(vec!["x".into()], FillStrategy::Median)
//!     .normalize(vec!["x".into()])
//!     .categorify(vec!["cat".into()], vec![])
//!     .build()?;
//! let executor = ParallelExecutor::new();
//! pipeline.run_and_write(input, Path::new("out/"), WriteOptions::default(), &executor)?;
//! # Ok(())
//! # }
//! ```

pub mod categorify;
pub mod config;
pub mod constants;
pub mod dataset;
pub mod error;
pub mod executor;
pub mod generate;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod schema;
pub mod shuffle;
pub mod stats;
pub mod transform;
pub mod writer;

pub use categorify::{
    Categorifier, CategorifyTransform, CategoryCache, CategoryDictionary, ColumnDictionary,
    ComboColumn,
};
pub use config::{parse_config, resolve_path, validate_config, PipelineConfig};
pub use dataset::{Dataset, Partition};
pub use error::{PrepError, Result};
pub use executor::{CancelToken, Executor, ParallelExecutor, SequentialExecutor};
pub use generate::{generate, GenerateOptions};
pub use memory::{parse_byte_suffix, PartitionSize};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineOutput, Stage};
pub use schema::{ColumnEntry, ColumnType};
pub use shuffle::{ShuffleMode, ShuffleReport, ShuffleSpec, ShuffleStage};
pub use stats::{ColumnStatistics, QuantileSketch, Statistic, Statistics, StatisticsCollector};
pub use transform::{ColumnTransform, FillMissing, FillStrategy, Normalize};
pub use writer::{
    is_output_dir, FileEntry, Manifest, ParquetCompression, ParquetWriteOptions, WriteOptions,
    Writer,
};
