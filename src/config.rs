//! TOML pipeline configuration.
//!
//! A config file names the input, the stages to run and the output. Paths
//! inside it are relative to the directory holding the file. The usual flow
//! is [`parse_config`], then [`validate_config`], then
//! [`PipelineConfig::build_pipeline`].

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::categorify::{CategoryCache, ComboColumn};
use crate::constants::{
    files, DEFAULT_MAX_RETRIES, DEFAULT_QUANTILE_EPSILON, DEFAULT_ROW_GROUP_SIZE,
    DEFAULT_STD_EPSILON,
};
use crate::error::{PrepError, Result};
use crate::executor::ParallelExecutor;
use crate::memory::{parse_byte_suffix, PartitionSize};
use crate::pipeline::{Pipeline, PipelineBuilder, Stage};
use crate::shuffle::ShuffleSpec;
use crate::transform::FillStrategy;
use crate::writer::{ParquetCompression, ParquetWriteOptions, WriteOptions};

#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    pub input: InputSettings,
    #[serde(default)]
    pub statistics: StatisticsSettings,
    pub fill: Option<FillSettings>,
    pub normalize: Option<NormalizeSettings>,
    pub categorify: Option<CategorifySettings>,
    #[serde(default)]
    pub shuffle: ShuffleSettings,
    pub output: OutputSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
}

#[derive(Debug, Deserialize)]
pub struct InputSettings {
    pub paths: Vec<PathBuf>,
    /// Byte budget with optional suffix ("256M", "1G").
    pub partition_size: Option<String>,
    /// Fraction of available memory, in (0, 1].
    pub partition_size_fraction: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct StatisticsSettings {
    #[serde(default = "default_quantile_epsilon")]
    pub quantile_epsilon: f64,
    #[serde(default)]
    pub allow_empty_fallback: bool,
}

impl Default for StatisticsSettings {
    fn default() -> Self {
        Self {
            quantile_epsilon: DEFAULT_QUANTILE_EPSILON,
            allow_empty_fallback: false,
        }
    }
}

fn default_quantile_epsilon() -> f64 {
    DEFAULT_QUANTILE_EPSILON
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FillKind {
    Median,
    Mean,
    Constant,
}

#[derive(Debug, Deserialize)]
pub struct FillSettings {
    pub columns: Vec<String>,
    pub strategy: FillKind,
    /// Required for `constant`.
    pub value: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct NormalizeSettings {
    pub columns: Vec<String>,
    #[serde(default = "default_std_epsilon")]
    pub epsilon: f64,
}

fn default_std_epsilon() -> f64 {
    DEFAULT_STD_EPSILON
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    #[default]
    Memory,
    Disk,
}

#[derive(Debug, Deserialize)]
pub struct CategorifySettings {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub combos: Vec<Vec<String>>,
    #[serde(default)]
    pub freq_threshold: u64,
    #[serde(default)]
    pub cache: CacheKind,
    /// Disk cache directory; defaults to `categories` next to the config.
    pub cache_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShuffleKind {
    #[default]
    Off,
    /// Same as `random`.
    On,
    Random,
    Key,
}

#[derive(Debug, Deserialize, Default)]
pub struct ShuffleSettings {
    #[serde(default)]
    pub mode: ShuffleKind,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub key: Vec<String>,
    /// Output partition count; defaults to the input partition count.
    pub partitions: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct OutputSettings {
    pub path: PathBuf,
    #[serde(default = "default_files_per_partition")]
    pub files_per_partition: usize,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub compression: ParquetCompression,
    #[serde(default = "default_row_group_size")]
    pub row_group_size: usize,
}

fn default_files_per_partition() -> usize {
    1
}

fn default_row_group_size() -> usize {
    DEFAULT_ROW_GROUP_SIZE
}

#[derive(Debug, Deserialize)]
pub struct ExecutionSettings {
    /// Worker threads; 0 uses the global rayon pool.
    #[serde(default)]
    pub threads: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            threads: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

pub fn parse_config(path: &Path) -> Result<PipelineConfig> {
    let contents =
        fs::read_to_string(path).map_err(|e| PrepError::io(path, "read config file", e))?;

    let config: PipelineConfig = toml::from_str(&contents)
        .map_err(|e| PrepError::format(path, format!("invalid TOML config: {}", e)))?;

    if config.input.paths.is_empty() {
        return Err(PrepError::validation(
            "Config must list at least one input path",
        ));
    }

    Ok(config)
}

/// Check the settings and that every input path exists.
pub fn validate_config(config: &PipelineConfig, config_dir: &Path) -> Result<()> {
    if config.input.paths.is_empty() {
        return Err(PrepError::validation(
            "Config must list at least one input path",
        ));
    }
    config.partition_size()?.validate()?;

    let eps = config.statistics.quantile_epsilon;
    if !(eps > 0.0 && eps < 0.5) {
        return Err(PrepError::validation(format!(
            "Config error: quantile_epsilon must be in (0, 0.5) (got {})",
            eps
        )));
    }

    if let Some(fill) = &config.fill {
        if fill.strategy == FillKind::Constant && fill.value.is_none() {
            return Err(PrepError::validation(
                "Config error: fill strategy 'constant' requires a value",
            ));
        }
    }

    if let Some(cat) = &config.categorify {
        if let Some(combo) = cat.combos.iter().find(|c| c.len() < 2) {
            return Err(PrepError::validation(format!(
                "Config error: combo {:?} needs at least two columns",
                combo
            )));
        }
        if cat.cache == CacheKind::Disk {
            let cache = config.cache_dir(config_dir);
            let output = resolve_path(config_dir, &config.output.path);
            if cache.starts_with(&output) {
                return Err(PrepError::validation(format!(
                    "Config error: cache_path {} lies inside the output directory {}",
                    cache.display(),
                    output.display()
                )));
            }
        }
    }

    let shuffle = &config.shuffle;
    if shuffle.mode == ShuffleKind::Key && shuffle.key.is_empty() {
        return Err(PrepError::validation(
            "Config error: shuffle mode 'key' requires key columns",
        ));
    }
    if shuffle.partitions == Some(0) {
        return Err(PrepError::validation(
            "Config error: shuffle partitions must be > 0",
        ));
    }

    if config.output.files_per_partition == 0 {
        return Err(PrepError::validation(
            "Config error: files_per_partition must be > 0",
        ));
    }
    if config.output.row_group_size == 0 {
        return Err(PrepError::validation(
            "Config error: row_group_size must be > 0",
        ));
    }

    let missing: Vec<PathBuf> = config
        .input_paths(config_dir)
        .into_iter()
        .filter(|p| !p.exists())
        .collect();
    if !missing.is_empty() {
        return Err(PrepError::SourceNotFound { sources: missing });
    }

    // The writer replaces the output directory, so it must not hold any input.
    let output = absolute(&config.output_path(config_dir));
    for input in config.input_paths(config_dir) {
        let input_abs = absolute(&input);
        if input_abs.starts_with(&output) || output.starts_with(&input_abs) {
            return Err(PrepError::validation(format!(
                "Config error: output path {} overlaps input path {}",
                config.output.path.display(),
                input.display()
            )));
        }
    }

    Ok(())
}

/// Canonical form of `path`, or of its parent when `path` does not exist yet.
fn absolute(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

pub fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl PipelineConfig {
    /// Partition budget; exactly one of the two settings must be present.
    pub fn partition_size(&self) -> Result<PartitionSize> {
        match (&self.input.partition_size, self.input.partition_size_fraction) {
            (Some(_), Some(_)) => Err(PrepError::validation(
                "Config error: set only one of partition_size and partition_size_fraction",
            )),
            (None, None) => Err(PrepError::validation(
                "Config error: one of partition_size or partition_size_fraction is required",
            )),
            (Some(size), None) => match parse_byte_suffix(size)? {
                Some(bytes) => Ok(PartitionSize::Bytes(bytes)),
                None => Err(PrepError::validation(
                    "Config error: partition_size 'auto' is not supported, \
                     use partition_size_fraction",
                )),
            },
            (None, Some(fraction)) => Ok(PartitionSize::Fraction(fraction)),
        }
    }

    pub fn input_paths(&self, config_dir: &Path) -> Vec<PathBuf> {
        self.input
            .paths
            .iter()
            .map(|p| resolve_path(config_dir, p))
            .collect()
    }

    pub fn output_path(&self, config_dir: &Path) -> PathBuf {
        resolve_path(config_dir, &self.output.path)
    }

    fn cache_dir(&self, config_dir: &Path) -> PathBuf {
        match self.categorify.as_ref().and_then(|c| c.cache_path.as_ref()) {
            Some(path) => resolve_path(config_dir, path),
            None => config_dir.join(files::CATEGORIES_DIR),
        }
    }

    /// Build the stages in fixed order: fill, normalize, categorify, shuffle.
    ///
    /// `input_partitions` is the shuffle target when `partitions` is unset.
    pub fn build_pipeline(&self, config_dir: &Path, input_partitions: usize) -> Result<Pipeline> {
        let mut builder = PipelineBuilder::new()
            .quantile_epsilon(self.statistics.quantile_epsilon)
            .allow_empty_fallback(self.statistics.allow_empty_fallback);

        if let Some(fill) = &self.fill {
            let strategy = match fill.strategy {
                FillKind::Median => FillStrategy::Median,
                FillKind::Mean => FillStrategy::Mean,
                FillKind::Constant => FillStrategy::Constant(fill.value.ok_or_else(|| {
                    PrepError::validation("Config error: fill strategy 'constant' requires a value")
                })?),
            };
            builder = builder.fill_missing(fill.columns.clone(), strategy);
        }

        if let Some(norm) = &self.normalize {
            builder = builder.stage(Stage::Normalize {
                columns: norm.columns.clone(),
                epsilon: norm.epsilon,
            });
        }

        if let Some(cat) = &self.categorify {
            let cache = match cat.cache {
                CacheKind::Memory => CategoryCache::Memory,
                CacheKind::Disk => CategoryCache::Disk(self.cache_dir(config_dir)),
            };
            builder = builder.stage(Stage::Categorify {
                columns: cat.columns.clone(),
                combos: cat.combos.iter().map(ComboColumn::new).collect(),
                freq_threshold: cat.freq_threshold,
                cache,
            });
        }

        let partitions = self.shuffle.partitions.unwrap_or(input_partitions);
        match self.shuffle.mode {
            ShuffleKind::Off => {}
            ShuffleKind::On | ShuffleKind::Random => {
                builder = builder.shuffle(ShuffleSpec::random(self.shuffle.seed, partitions));
            }
            ShuffleKind::Key => {
                builder =
                    builder.shuffle(ShuffleSpec::by_key(self.shuffle.key.clone(), partitions));
            }
        }

        builder.build()
    }

    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            files_per_partition: self.output.files_per_partition,
            overwrite: self.output.overwrite,
            parquet: ParquetWriteOptions {
                row_group_size: self.output.row_group_size,
                compression: self.output.compression,
                ..Default::default()
            },
        }
    }

    pub fn executor(&self) -> Result<ParallelExecutor> {
        Ok(ParallelExecutor::with_threads(self.execution.threads)?
            .max_retries(self.execution.max_retries))
    }
}
