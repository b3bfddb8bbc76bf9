//! Constants used throughout tabprep for defaults, file layout and limits.
//!
//! Centralizing these keeps the pipeline stages, the writer and the
//! configuration layer in agreement.

// ============================================================================
// Statistics
// ============================================================================

/// Small constant added to the variance before the square root and to the
/// standard deviation before dividing during normalization.
pub const DEFAULT_STD_EPSILON: f64 = 1e-7;

/// Rank error bound for the quantile sketch, as a fraction of the row count.
pub const DEFAULT_QUANTILE_EPSILON: f64 = 0.001;

// ============================================================================
// Categorify
// ============================================================================

/// Reserved code for null and unseen category values.
pub const UNSEEN_CODE: u32 = 0;

/// Separator between source values when building a combo key (ASCII unit
/// separator, which does not occur in ordinary text).
pub const COMBO_KEY_SEPARATOR: char = '\u{1f}';

/// Separator between source column names when naming a combo column.
pub const COMBO_NAME_SEPARATOR: &str = "_";

// ============================================================================
// Partitioning
// ============================================================================

/// Default partition byte budget (256MB).
pub const DEFAULT_PARTITION_BYTES: usize = 256 * 1024 * 1024;

/// Rows per Arrow batch when reading Parquet row groups.
pub(crate) const READ_BATCH_SIZE: usize = 64 * 1024;

// ============================================================================
// Output
// ============================================================================

/// Default row group size for Parquet output files.
pub const DEFAULT_ROW_GROUP_SIZE: usize = 100_000;

/// Rows handed to the Parquet writer per `write` call.
pub(crate) const WRITE_BATCH_ROWS: usize = 16 * 1024;

/// Default number of bounded retries for transient per-partition failures.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Magic string identifying a tabprep output manifest.
pub const FORMAT_MAGIC: &str = "TABPREP_PARQUET_V1";

/// Magic string identifying a persisted category dictionary.
pub const DICTIONARY_MAGIC: &str = "TABPREP_CATEGORIES_V1";

/// Format version written to manifests and dictionaries.
/// Increment when making breaking changes to either layout.
pub const FORMAT_VERSION: u32 = 1;

/// Standard file names inside output and dictionary directories.
pub mod files {
    pub const MANIFEST: &str = "manifest.toml";
    pub const DICTIONARY: &str = "categories.toml";
    pub const CATEGORIES_DIR: &str = "categories";

    /// File name for one output file of a partition.
    pub fn part_file(partition: usize, file_index: usize) -> String {
        format!("part.{:05}.{:03}.parquet", partition, file_index)
    }

    /// File name for the unique values of the `index`-th encoded column.
    pub fn unique_file(index: usize) -> String {
        format!("unique.{:03}.parquet", index)
    }

    /// Temporary name used while a file is being written.
    pub fn temp_name(final_name: &str) -> String {
        format!(".{}.tmp", final_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_file_names_sort_by_partition() {
        let a = files::part_file(2, 0);
        let b = files::part_file(10, 0);
        assert!(a < b, "zero padding should keep lexical order: {} {}", a, b);
        assert_eq!(files::part_file(0, 1), "part.00000.001.parquet");
    }

    #[test]
    fn test_temp_name_is_hidden() {
        let tmp = files::temp_name("part.00000.000.parquet");
        assert!(tmp.starts_with('.'));
        assert!(tmp.ends_with(".tmp"));
    }

    #[test]
    fn test_epsilons_are_small_and_positive() {
        assert!(DEFAULT_STD_EPSILON > 0.0 && DEFAULT_STD_EPSILON < 1e-3);
        assert!(DEFAULT_QUANTILE_EPSILON > 0.0 && DEFAULT_QUANTILE_EPSILON < 0.5);
    }

    #[test]
    fn test_batch_sizes_reasonable() {
        assert!(READ_BATCH_SIZE > 0);
        assert!(WRITE_BATCH_ROWS > 0);
        assert!(WRITE_BATCH_ROWS <= DEFAULT_ROW_GROUP_SIZE);
    }
}
