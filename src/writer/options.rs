//! Output write options.

use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties, WriterVersion};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_ROW_GROUP_SIZE;
use crate::error::{PrepError, Result};

/// Compression codec for output Parquet files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    /// Snappy compression (fast, moderate ratio). Default.
    #[default]
    Snappy,
    /// Zstd compression (slower, better ratio).
    Zstd,
}

/// Parquet settings for partition files.
///
/// # Example
/// ```ignore
/// let opts = ParquetWriteOptions {
///     compression: ParquetCompression::Zstd,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ParquetWriteOptions {
    /// Maximum rows per row group. Default: 100,000.
    ///
    /// Row groups are the unit `Dataset::open` packs into partitions, so
    /// smaller groups give finer partition boundaries when the output is
    /// read back with a byte budget.
    pub row_group_size: usize,

    /// Compression codec. Default: Snappy.
    pub compression: ParquetCompression,

    /// Write page-level statistics. Default: true.
    pub write_statistics: bool,
}

impl Default for ParquetWriteOptions {
    fn default() -> Self {
        Self {
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
            compression: ParquetCompression::Snappy,
            write_statistics: true,
        }
    }
}

impl ParquetWriteOptions {
    pub fn validate(&self) -> Result<()> {
        if self.row_group_size == 0 {
            return Err(PrepError::validation("row_group_size must be > 0"));
        }
        Ok(())
    }

    /// Build `WriterProperties` for every partition file.
    pub fn to_writer_properties(&self) -> Result<WriterProperties> {
        self.validate()?;

        let compression = match self.compression {
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
        };
        let statistics = if self.write_statistics {
            EnabledStatistics::Page
        } else {
            EnabledStatistics::None
        };

        Ok(WriterProperties::builder()
            .set_writer_version(WriterVersion::PARQUET_2_0)
            .set_compression(compression)
            .set_statistics_enabled(statistics)
            .set_max_row_group_size(self.row_group_size)
            .build())
    }
}

/// Options for [`Writer`](super::Writer).
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOptions {
    /// Files written per input partition (capped at the partition's rows).
    pub files_per_partition: usize,
    /// Replace an existing output directory instead of failing.
    pub overwrite: bool,
    pub parquet: ParquetWriteOptions,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            files_per_partition: 1,
            overwrite: false,
            parquet: ParquetWriteOptions::default(),
        }
    }
}

impl WriteOptions {
    pub fn validate(&self) -> Result<()> {
        if self.files_per_partition == 0 {
            return Err(PrepError::validation("files_per_partition must be > 0"));
        }
        self.parquet.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(WriteOptions::default().validate().is_ok());
        let props = ParquetWriteOptions::default().to_writer_properties().unwrap();
        assert_eq!(props.max_row_group_size(), DEFAULT_ROW_GROUP_SIZE);
    }

    #[test]
    fn test_zero_values_rejected() {
        let opts = WriteOptions {
            files_per_partition: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let parquet = ParquetWriteOptions {
            row_group_size: 0,
            ..Default::default()
        };
        assert!(parquet.to_writer_properties().is_err());
    }

    #[test]
    fn test_compression_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            c: ParquetCompression,
        }
        let w: Wrapper = toml::from_str("c = \"zstd\"").unwrap();
        assert_eq!(w.c, ParquetCompression::Zstd);
    }
}
