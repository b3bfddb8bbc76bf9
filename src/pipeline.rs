//! Immutable preprocessing pipelines.
//!
//! A [`PipelineBuilder`] collects stages; [`PipelineBuilder::build`]
//! validates them and returns a [`Pipeline`] that never changes afterwards.
//! Running a pipeline threads a [`Dataset`] through the stages in order:
//!
//! - FillMissing and Normalize first collect the statistics they need over
//!   the dataset as it is at that point (so normalize statistics see filled
//!   values), then attach their transform
//! - Categorify builds the dictionary, passes it through its cache and
//!   attaches the encoding transform
//! - Shuffle materializes the dataset into a new partitioning
//!
//! Every statistics pass, dictionary pass and shuffle is a barrier: the next
//! stage starts only after all partitions have contributed.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::categorify::{
    Categorifier, CategorifyTransform, CategoryCache, CategoryDictionary, ComboColumn,
};
use crate::constants::{DEFAULT_QUANTILE_EPSILON, DEFAULT_STD_EPSILON};
use crate::dataset::Dataset;
use crate::error::{PrepError, Result};
use crate::executor::Executor;
use crate::shuffle::{ShuffleMode, ShuffleReport, ShuffleSpec, ShuffleStage};
use crate::stats::{Statistic, Statistics, StatisticsCollector};
use crate::transform::{FillMissing, FillStrategy, Normalize};
use crate::writer::{check_not_reading_from, Manifest, WriteOptions, Writer};

/// One pipeline step.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    FillMissing {
        columns: Vec<String>,
        strategy: FillStrategy,
    },
    Normalize {
        columns: Vec<String>,
        epsilon: f64,
    },
    Categorify {
        columns: Vec<String>,
        combos: Vec<ComboColumn>,
        freq_threshold: u64,
        cache: CategoryCache,
    },
    Shuffle(ShuffleSpec),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::FillMissing { .. } => "fill_missing",
            Stage::Normalize { .. } => "normalize",
            Stage::Categorify { .. } => "categorify",
            Stage::Shuffle(_) => "shuffle",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Stage::FillMissing { columns, strategy } => {
                if columns.is_empty() {
                    return Err(PrepError::validation("fill_missing needs at least one column"));
                }
                if let FillStrategy::Constant(v) = strategy {
                    if !v.is_finite() {
                        return Err(PrepError::validation(format!(
                            "fill constant must be finite, got {}",
                            v
                        )));
                    }
                }
            }
            Stage::Normalize { columns, epsilon } => {
                if columns.is_empty() {
                    return Err(PrepError::validation("normalize needs at least one column"));
                }
                if !(*epsilon > 0.0 && epsilon.is_finite()) {
                    return Err(PrepError::validation(format!(
                        "normalize epsilon must be > 0, got {}",
                        epsilon
                    )));
                }
            }
            Stage::Categorify {
                columns, combos, ..
            } => {
                if columns.is_empty() && combos.is_empty() {
                    return Err(PrepError::validation(
                        "categorify needs at least one column or combo",
                    ));
                }
                if let Some(combo) = combos.iter().find(|c| c.sources.len() < 2) {
                    return Err(PrepError::validation(format!(
                        "combo {:?} needs at least two columns",
                        combo.sources
                    )));
                }
            }
            Stage::Shuffle(spec) => {
                if spec.num_partitions == 0 {
                    return Err(PrepError::validation("shuffle partitions must be > 0"));
                }
                if matches!(&spec.mode, ShuffleMode::Key(cols) if cols.is_empty()) {
                    return Err(PrepError::validation("key shuffle needs key columns"));
                }
            }
        }
        Ok(())
    }
}

/// Collects stages for a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
    quantile_epsilon: f64,
    allow_empty_fallback: bool,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            quantile_epsilon: DEFAULT_QUANTILE_EPSILON,
            allow_empty_fallback: false,
        }
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn fill_missing(self, columns: Vec<String>, strategy: FillStrategy) -> Self {
        self.stage(Stage::FillMissing { columns, strategy })
    }

    pub fn normalize(self, columns: Vec<String>) -> Self {
        self.stage(Stage::Normalize {
            columns,
            epsilon: DEFAULT_STD_EPSILON,
        })
    }

    pub fn categorify(self, columns: Vec<String>, combos: Vec<ComboColumn>) -> Self {
        self.stage(Stage::Categorify {
            columns,
            combos,
            freq_threshold: 0,
            cache: CategoryCache::Memory,
        })
    }

    pub fn shuffle(self, spec: ShuffleSpec) -> Self {
        self.stage(Stage::Shuffle(spec))
    }

    pub fn quantile_epsilon(mut self, epsilon: f64) -> Self {
        self.quantile_epsilon = epsilon;
        self
    }

    pub fn allow_empty_fallback(mut self, allow: bool) -> Self {
        self.allow_empty_fallback = allow;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        if self.stages.is_empty() {
            return Err(PrepError::validation("Pipeline has no stages"));
        }
        if !(self.quantile_epsilon > 0.0 && self.quantile_epsilon < 0.5) {
            return Err(PrepError::validation(format!(
                "quantile_epsilon must be in (0, 0.5), got {}",
                self.quantile_epsilon
            )));
        }
        if self
            .stages
            .iter()
            .filter(|s| matches!(s, Stage::Categorify { .. }))
            .count()
            > 1
        {
            return Err(PrepError::validation(
                "Pipeline may contain at most one categorify stage",
            ));
        }
        for stage in &self.stages {
            stage.validate()?;
        }
        Ok(Pipeline {
            stages: self.stages,
            quantile_epsilon: self.quantile_epsilon,
            allow_empty_fallback: self.allow_empty_fallback,
        })
    }
}

/// Result of running a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Transformed dataset; lazy unless a shuffle materialized it.
    pub dataset: Dataset,
    /// Every statistic collected by the run, by column.
    pub statistics: Statistics,
    pub dictionary: Option<Arc<CategoryDictionary>>,
    pub shuffle: Option<ShuffleReport>,
}

/// An immutable, validated list of stages.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    quantile_epsilon: f64,
    allow_empty_fallback: bool,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn collector(&self, columns: &[String], stats: Vec<Statistic>) -> StatisticsCollector {
        StatisticsCollector::new(columns.iter().cloned(), stats)
            .quantile_epsilon(self.quantile_epsilon)
            .allow_empty_fallback(self.allow_empty_fallback)
    }

    /// Thread `input` through every stage.
    pub fn run<E: Executor>(&self, input: Dataset, executor: &E) -> Result<PipelineOutput> {
        let t_start = Instant::now();
        let mut dataset = input;
        let mut statistics = Statistics::default();
        let mut dictionary = None;
        let mut shuffle = None;

        log::info!(
            "Running pipeline: {} stage(s) over {} partition(s), {} rows",
            self.stages.len(),
            dataset.num_partitions(),
            dataset.total_rows()
        );

        for (n, stage) in self.stages.iter().enumerate() {
            let t_stage = Instant::now();
            log::info!("Stage {}/{}: {}", n + 1, self.stages.len(), stage.name());

            match stage {
                Stage::FillMissing { columns, strategy } => {
                    let stats = match strategy.required_statistic() {
                        Some(required) => self
                            .collector(columns, vec![Statistic::NullCount, required])
                            .collect(&dataset, executor)?,
                        None => Statistics::default(),
                    };
                    let fill = FillMissing::new(columns, *strategy, &stats, dataset.schema())?;
                    statistics = statistics.merged_with(&stats);
                    dataset = dataset.with_transform(Arc::new(fill))?;
                }
                Stage::Normalize { columns, epsilon } => {
                    let stats = self
                        .collector(columns, vec![Statistic::Mean, Statistic::Std])
                        .std_epsilon(*epsilon)
                        .collect(&dataset, executor)?;
                    let normalize = Normalize::new(columns, &stats, dataset.schema(), *epsilon)?;
                    statistics = statistics.merged_with(&stats);
                    dataset = dataset.with_transform(Arc::new(normalize))?;
                }
                Stage::Categorify {
                    columns,
                    combos,
                    freq_threshold,
                    cache,
                } => {
                    let built = Categorifier::new(columns.clone(), combos.clone())
                        .freq_threshold(*freq_threshold)
                        .build_dictionary(&dataset, executor)?;
                    let cached = Arc::new(cache.persist(built)?);
                    let transform = CategorifyTransform::new(cached.clone(), dataset.schema())?;
                    dataset = dataset.with_transform(Arc::new(transform))?;
                    dictionary = Some(cached);
                }
                Stage::Shuffle(spec) => {
                    let (shuffled, report) =
                        ShuffleStage::new(spec.clone()).run(&dataset, executor)?;
                    dataset = shuffled;
                    shuffle = Some(report);
                }
            }
            log::info!("Stage {} done in {:.2?}", stage.name(), t_stage.elapsed());
        }

        log::info!("Pipeline finished in {:.2?}", t_start.elapsed());
        Ok(PipelineOutput {
            dataset,
            statistics,
            dictionary,
            shuffle,
        })
    }

    /// Run the pipeline and write the result to `output_dir`.
    ///
    /// When the pipeline categorifies, the dictionary is also saved to
    /// `output_dir/categories` (before the manifest) so the output can be
    /// decoded later.
    pub fn run_and_write<E: Executor>(
        &self,
        input: Dataset,
        output_dir: &Path,
        options: WriteOptions,
        executor: &E,
    ) -> Result<(PipelineOutput, Manifest)> {
        // A shuffle materializes the data, so check the original sources here.
        check_not_reading_from(&input, output_dir)?;
        let output = self.run(input, executor)?;
        let manifest = Writer::new(options).write_with_dictionary(
            &output.dataset,
            output_dir,
            output.dictionary.as_deref(),
            executor,
        )?;
        Ok((output, manifest))
    }
}
