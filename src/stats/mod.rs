//! Global per-column statistics collected in one parallel read pass.
//!
//! Each partition produces a [`PartialStatistics`] per requested column
//! (count, null count, sum, sum of squares, min, max and a quantile sketch).
//! Partials are merged after the barrier; the merge is associative and
//! commutative, so the result does not depend on partition count or order
//! beyond floating-point rounding.
//!
//! Finalization:
//! - `mean = sum / count`
//! - `variance = max(sum_sq / count - mean^2, 0)`
//! - `std = sqrt(variance + epsilon)`
//!
//! Quantiles always come from the merged Greenwald-Khanna sketch, whatever
//! the partition count. The sketch is exact while all values fit in its
//! buffer, and min/max (quantiles 0 and 1) are always exact.

pub mod sketch;

use arrow::array::{Array, ArrayRef, Float64Array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Schema};
use arrow::record_batch::RecordBatch;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use crate::constants::{DEFAULT_QUANTILE_EPSILON, DEFAULT_STD_EPSILON};
use crate::dataset::Dataset;
use crate::error::{PrepError, Result};
use crate::executor::Executor;
use crate::schema::column_type;

pub use sketch::QuantileSketch;

/// A statistic that can be requested for a column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Count,
    NullCount,
    Mean,
    Std,
    Min,
    Max,
    /// Value at quantile `p` in `[0, 1]`.
    Quantile(f64),
}

impl Statistic {
    /// Whether the statistic needs numeric values (everything but counts).
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Statistic::Count | Statistic::NullCount)
    }

    /// Median as a quantile request.
    pub fn median() -> Self {
        Statistic::Quantile(0.5)
    }

    /// Every statistic with the given quantiles, used by the CLI.
    pub fn all_with_quantiles(quantiles: &[f64]) -> Vec<Statistic> {
        let mut stats = vec![
            Statistic::Count,
            Statistic::NullCount,
            Statistic::Mean,
            Statistic::Std,
            Statistic::Min,
            Statistic::Max,
        ];
        stats.extend(quantiles.iter().map(|&p| Statistic::Quantile(p)));
        stats
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Count => write!(f, "count"),
            Statistic::NullCount => write!(f, "null_count"),
            Statistic::Mean => write!(f, "mean"),
            Statistic::Std => write!(f, "std"),
            Statistic::Min => write!(f, "min"),
            Statistic::Max => write!(f, "max"),
            Statistic::Quantile(p) => write!(f, "q{}", p),
        }
    }
}

/// Final statistics for one column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStatistics {
    /// Non-null (and non-NaN, for numeric columns) values.
    pub count: u64,
    pub null_count: u64,
    pub sum: f64,
    pub sum_sq: f64,
    pub mean: f64,
    pub variance: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    /// `(p, value)` for each requested quantile, in request order.
    pub quantiles: Vec<(f64, f64)>,
    /// Set when the values are the empty-column defaults.
    pub fallback: bool,
}

impl ColumnStatistics {
    /// Defaults used for an empty column when the caller opts in:
    /// mean 0, variance 0, std = sqrt(epsilon), every quantile 0.
    pub fn empty_fallback(null_count: u64, quantiles: &[f64], std_epsilon: f64) -> Self {
        Self {
            count: 0,
            null_count,
            sum: 0.0,
            sum_sq: 0.0,
            mean: 0.0,
            variance: 0.0,
            std: std_epsilon.sqrt(),
            min: 0.0,
            max: 0.0,
            quantiles: quantiles.iter().map(|&p| (p, 0.0)).collect(),
            fallback: true,
        }
    }

    /// Look up a collected quantile.
    pub fn quantile(&self, p: f64) -> Option<f64> {
        self.quantiles
            .iter()
            .find(|(q, _)| (q - p).abs() < 1e-12)
            .map(|&(_, v)| v)
    }

    pub fn median(&self) -> Option<f64> {
        self.quantile(0.5)
    }

    /// Value of a requested statistic.
    pub fn value(&self, statistic: Statistic) -> Option<f64> {
        match statistic {
            Statistic::Count => Some(self.count as f64),
            Statistic::NullCount => Some(self.null_count as f64),
            Statistic::Mean => Some(self.mean),
            Statistic::Std => Some(self.std),
            Statistic::Min => Some(self.min),
            Statistic::Max => Some(self.max),
            Statistic::Quantile(p) => self.quantile(p),
        }
    }
}

/// Column name to statistics. Immutable once collected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    columns: BTreeMap<String, ColumnStatistics>,
}

impl Statistics {
    pub fn new(columns: BTreeMap<String, ColumnStatistics>) -> Self {
        Self { columns }
    }

    pub fn get(&self, column: &str) -> Option<&ColumnStatistics> {
        self.columns.get(column)
    }

    /// Like [`get`](Self::get) but fails with a validation error.
    pub fn require(&self, column: &str) -> Result<&ColumnStatistics> {
        self.columns.get(column).ok_or_else(|| {
            PrepError::validation(format!("No statistics collected for column '{}'", column))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ColumnStatistics)> {
        self.columns.iter()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Combine two statistics maps; entries in `other` win.
    pub fn merged_with(&self, other: &Statistics) -> Statistics {
        let mut columns = self.columns.clone();
        columns.extend(other.columns.iter().map(|(k, v)| (k.clone(), v.clone())));
        Statistics { columns }
    }
}

/// Mergeable per-partition accumulator for one column.
#[derive(Debug, Clone)]
pub struct PartialStatistics {
    pub count: u64,
    pub null_count: u64,
    pub sum: f64,
    pub sum_sq: f64,
    pub min: f64,
    pub max: f64,
    sketch: Option<QuantileSketch>,
}

impl PartialStatistics {
    /// Empty accumulator. A sketch is kept only when `sketch_epsilon` is set.
    pub fn new(sketch_epsilon: Option<f64>) -> Self {
        Self {
            count: 0,
            null_count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sketch: sketch_epsilon.map(QuantileSketch::new),
        }
    }

    pub fn observe(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if let Some(sketch) = &mut self.sketch {
            sketch.insert(value);
        }
    }

    /// Accumulate a numeric column, cast to float64.
    pub fn observe_numeric(&mut self, array: &ArrayRef) -> Result<()> {
        let values = cast(array, &DataType::Float64)?;
        let values = values
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| PrepError::validation("Float64 cast produced an unexpected array"))?;
        self.null_count += values.null_count() as u64;
        for value in values.iter().flatten() {
            self.observe(value);
        }
        Ok(())
    }

    /// Accumulate only counts, for columns of any type.
    pub fn observe_counts(&mut self, array: &dyn Array) {
        self.null_count += array.null_count() as u64;
        self.count += (array.len() - array.null_count()) as u64;
    }

    pub fn merge(&mut self, other: &PartialStatistics) {
        self.count += other.count;
        self.null_count += other.null_count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        match (&mut self.sketch, &other.sketch) {
            (Some(mine), Some(theirs)) => mine.merge(theirs),
            (None, Some(theirs)) => self.sketch = Some(theirs.clone()),
            _ => {}
        }
    }
}

/// Collects global statistics for a set of columns.
#[derive(Debug, Clone)]
pub struct StatisticsCollector {
    columns: Vec<String>,
    statistics: Vec<Statistic>,
    std_epsilon: f64,
    quantile_epsilon: f64,
    allow_empty_fallback: bool,
}

impl StatisticsCollector {
    pub fn new<I, S>(columns: I, statistics: Vec<Statistic>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            statistics,
            std_epsilon: DEFAULT_STD_EPSILON,
            quantile_epsilon: DEFAULT_QUANTILE_EPSILON,
            allow_empty_fallback: false,
        }
    }

    pub fn std_epsilon(mut self, epsilon: f64) -> Self {
        self.std_epsilon = epsilon;
        self
    }

    pub fn quantile_epsilon(mut self, epsilon: f64) -> Self {
        self.quantile_epsilon = epsilon;
        self
    }

    /// Use default statistics instead of failing on all-null columns.
    pub fn allow_empty_fallback(mut self, allow: bool) -> Self {
        self.allow_empty_fallback = allow;
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    fn needs_numeric(&self) -> bool {
        self.statistics.iter().any(Statistic::is_numeric)
    }

    fn requested_quantiles(&self) -> Vec<f64> {
        self.statistics
            .iter()
            .filter_map(|s| match s {
                Statistic::Quantile(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    /// Check options and resolve each column to its index in `schema`.
    fn plan(&self, schema: &Schema) -> Result<Vec<usize>> {
        if !(self.std_epsilon > 0.0) {
            return Err(PrepError::validation(format!(
                "std_epsilon must be > 0, got {}",
                self.std_epsilon
            )));
        }
        if !(self.quantile_epsilon > 0.0 && self.quantile_epsilon < 0.5) {
            return Err(PrepError::validation(format!(
                "quantile_epsilon must be in (0, 0.5), got {}",
                self.quantile_epsilon
            )));
        }
        for p in self.requested_quantiles() {
            if !(0.0..=1.0).contains(&p) {
                return Err(PrepError::validation(format!(
                    "Quantile must be in [0, 1], got {}",
                    p
                )));
            }
        }

        let needs_numeric = self.needs_numeric();
        let mut indices = Vec::with_capacity(self.columns.len());
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].contains(column) {
                return Err(PrepError::validation(format!(
                    "Column '{}' listed twice",
                    column
                )));
            }
            let (idx, ty) = column_type(schema, column)?;
            if needs_numeric && !ty.is_numeric() {
                return Err(PrepError::validation(format!(
                    "Column '{}' must be numeric for {:?}, got {:?}",
                    column, self.statistics, ty
                )));
            }
            indices.push(idx);
        }
        Ok(indices)
    }

    /// Partials for one batch, one per requested column.
    fn partial_for_batch(
        &self,
        batch: &RecordBatch,
        indices: &[usize],
    ) -> Result<Vec<PartialStatistics>> {
        let needs_numeric = self.needs_numeric();
        let sketch_epsilon =
            (!self.requested_quantiles().is_empty()).then_some(self.quantile_epsilon);

        indices
            .iter()
            .map(|&idx| {
                let mut partial = PartialStatistics::new(sketch_epsilon);
                if needs_numeric {
                    partial.observe_numeric(batch.column(idx))?;
                } else {
                    partial.observe_counts(batch.column(idx).as_ref());
                }
                Ok(partial)
            })
            .collect()
    }

    /// Statistics for a single in-memory batch.
    pub fn collect_batch(&self, batch: &RecordBatch) -> Result<Statistics> {
        let indices = self.plan(&batch.schema())?;
        let partials = self.partial_for_batch(batch, &indices)?;
        self.finalize(partials)
    }

    /// Run the read pass over `dataset` and merge the partials.
    ///
    /// # Errors
    /// - `Validation` for unknown or non-numeric columns and bad options
    /// - `EmptyColumn` for a column with no values when a numeric statistic
    ///   is requested and the fallback is off
    pub fn collect<E: Executor>(&self, dataset: &Dataset, executor: &E) -> Result<Statistics> {
        let t_start = Instant::now();
        let indices = self.plan(&dataset.schema())?;
        log::info!(
            "Collecting statistics for {} column(s) over {} partition(s)",
            self.columns.len(),
            dataset.num_partitions()
        );

        let partials = executor.run("statistics", dataset.num_partitions(), |i| {
            let partition = dataset.read_partition(i)?;
            self.partial_for_batch(partition.batch(), &indices)
        })?;

        let sketch_epsilon =
            (!self.requested_quantiles().is_empty()).then_some(self.quantile_epsilon);
        let mut merged: Vec<PartialStatistics> = (0..self.columns.len())
            .map(|_| PartialStatistics::new(sketch_epsilon))
            .collect();
        for partition_partials in &partials {
            for (acc, partial) in merged.iter_mut().zip(partition_partials) {
                acc.merge(partial);
            }
        }

        let statistics = self.finalize(merged)?;
        log::info!(
            "Statistics collected for {} column(s) in {:.2?}",
            statistics.len(),
            t_start.elapsed()
        );
        Ok(statistics)
    }

    fn finalize(&self, merged: Vec<PartialStatistics>) -> Result<Statistics> {
        let quantiles = self.requested_quantiles();
        let mut columns = BTreeMap::new();
        for (column, partial) in self.columns.iter().zip(merged) {
            let stats = self.finalize_column(column, partial, &quantiles)?;
            columns.insert(column.clone(), stats);
        }
        Ok(Statistics::new(columns))
    }

    fn finalize_column(
        &self,
        column: &str,
        partial: PartialStatistics,
        quantiles: &[f64],
    ) -> Result<ColumnStatistics> {
        if partial.count == 0 && self.needs_numeric() {
            if self.allow_empty_fallback {
                log::warn!(
                    "Column '{}' has no non-null values; using default statistics",
                    column
                );
                return Ok(ColumnStatistics::empty_fallback(
                    partial.null_count,
                    quantiles,
                    self.std_epsilon,
                ));
            }
            return Err(PrepError::empty_column(column));
        }

        let (mean, variance) = if partial.count == 0 {
            (0.0, 0.0)
        } else {
            let n = partial.count as f64;
            let mean = partial.sum / n;
            (mean, (partial.sum_sq / n - mean * mean).max(0.0))
        };

        let quantile_values = match &partial.sketch {
            Some(sketch) => quantiles
                .iter()
                .map(|&p| (p, sketch.query(p).unwrap_or(0.0)))
                .collect(),
            None => Vec::new(),
        };

        Ok(ColumnStatistics {
            count: partial.count,
            null_count: partial.null_count,
            sum: partial.sum,
            sum_sq: partial.sum_sq,
            mean,
            variance,
            std: (variance + self.std_epsilon).sqrt(),
            min: if partial.count == 0 { 0.0 } else { partial.min },
            max: if partial.count == 0 { 0.0 } else { partial.max },
            quantiles: quantile_values,
            fallback: false,
        })
    }
}
