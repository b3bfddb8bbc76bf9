//! Per-partition column transforms.
//!
//! A [`ColumnTransform`] is fixed at construction: statistics, fill values
//! and output types are all decided once from the input schema, so every
//! partition of a dataset comes out with the same schema. `apply` never
//! touches its input batch and keeps row count and row order.

use arrow::array::{Array, ArrayRef, Float64Array, Scalar};
use arrow::compute::{cast, is_null};
use arrow::compute::kernels::zip::zip;
use arrow::datatypes::{DataType, Field, Float64Type, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use std::fmt;
use std::sync::Arc;

use crate::error::{PrepError, Result};
use crate::schema::{numeric_column, ColumnType};
use crate::stats::{Statistic, Statistics};

/// A pure, row-preserving transform over record batches.
pub trait ColumnTransform: Send + Sync + fmt::Debug {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Schema the transform was built for.
    fn input_schema(&self) -> &SchemaRef;

    /// Schema of every batch returned by [`apply`](Self::apply).
    fn output_schema(&self) -> &SchemaRef;

    fn apply(&self, batch: &RecordBatch) -> Result<RecordBatch>;
}

/// Check that `batch` matches the schema a transform was built for.
fn check_input(name: &str, expected: &SchemaRef, batch: &RecordBatch) -> Result<()> {
    if batch.schema().fields() != expected.fields() {
        return Err(PrepError::validation(format!(
            "{}: batch schema does not match the schema the transform was built for",
            name
        )));
    }
    Ok(())
}

/// Copy of `schema` with some fields replaced.
fn replace_fields(schema: &Schema, replacements: &[(usize, Field)]) -> SchemaRef {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(i, f)| {
            replacements
                .iter()
                .find(|(idx, _)| *idx == i)
                .map(|(_, field)| field.clone())
                .unwrap_or_else(|| f.as_ref().clone())
        })
        .collect();
    Arc::new(Schema::new(fields))
}

fn reject_duplicates(columns: &[String]) -> Result<()> {
    for (i, column) in columns.iter().enumerate() {
        if columns[..i].contains(column) {
            return Err(PrepError::validation(format!(
                "Column '{}' listed twice",
                column
            )));
        }
    }
    Ok(())
}

// ============================================================================
// FillMissing
// ============================================================================

/// Where a fill value comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillStrategy {
    Median,
    Mean,
    Constant(f64),
}

impl FillStrategy {
    /// Statistic that must be collected before building the transform.
    pub fn required_statistic(&self) -> Option<Statistic> {
        match self {
            FillStrategy::Median => Some(Statistic::median()),
            FillStrategy::Mean => Some(Statistic::Mean),
            FillStrategy::Constant(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
struct FillColumn {
    index: usize,
    name: String,
    value: f64,
    output_type: DataType,
}

/// Replaces nulls with a per-column value.
///
/// Integer columns keep their type when the fill value is integral and
/// representable, otherwise they become float64. Float columns keep their
/// type. Filled columns are non-nullable in the output schema.
#[derive(Debug, Clone)]
pub struct FillMissing {
    input_schema: SchemaRef,
    output_schema: SchemaRef,
    columns: Vec<FillColumn>,
}

impl FillMissing {
    pub fn new(
        columns: &[String],
        strategy: FillStrategy,
        statistics: &Statistics,
        input_schema: SchemaRef,
    ) -> Result<Self> {
        reject_duplicates(columns)?;
        let mut fill_columns = Vec::with_capacity(columns.len());
        let mut replacements = Vec::with_capacity(columns.len());

        for column in columns {
            let (index, column_type) = numeric_column(&input_schema, column)?;
            let value = match strategy {
                FillStrategy::Constant(v) => v,
                FillStrategy::Mean => statistics.require(column)?.mean,
                FillStrategy::Median => statistics.require(column)?.median().ok_or_else(|| {
                    PrepError::validation(format!("Median was not collected for '{}'", column))
                })?,
            };
            if !value.is_finite() {
                return Err(PrepError::validation(format!(
                    "Fill value for '{}' must be finite, got {}",
                    column, value
                )));
            }

            let output_type = fill_output_type(column_type, value);
            if output_type != column_type.to_data_type() {
                log::debug!(
                    "Fill value {} for '{}' is not a valid {:?}; column becomes Float64",
                    value,
                    column,
                    column_type
                );
            }
            replacements.push((index, Field::new(column, output_type.clone(), false)));
            fill_columns.push(FillColumn {
                index,
                name: column.clone(),
                value,
                output_type,
            });
        }

        Ok(Self {
            output_schema: replace_fields(&input_schema, &replacements),
            input_schema,
            columns: fill_columns,
        })
    }

    /// Fill value chosen for `column`.
    pub fn fill_value(&self, column: &str) -> Option<f64> {
        self.columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.value)
    }

    fn fill_array(&self, column: &FillColumn, array: &ArrayRef) -> Result<ArrayRef> {
        let values = if array.data_type() == &column.output_type {
            array.clone()
        } else {
            cast(array, &column.output_type)?
        };
        if values.null_count() == 0 {
            return Ok(values);
        }
        let fill = cast(&Float64Array::from(vec![column.value]), &column.output_type)?;
        let mask = is_null(&values)?;
        Ok(zip(&mask, &Scalar::new(fill), &values)?)
    }
}

fn fill_output_type(column_type: ColumnType, value: f64) -> DataType {
    let integral = value.fract() == 0.0;
    let fits = match column_type {
        ColumnType::Int32 => integral && value >= i32::MIN as f64 && value <= i32::MAX as f64,
        ColumnType::Int64 => integral && value >= i64::MIN as f64 && value < i64::MAX as f64,
        ColumnType::UInt32 => integral && value >= 0.0 && value <= u32::MAX as f64,
        ColumnType::UInt64 => integral && value >= 0.0 && value < u64::MAX as f64,
        _ => true,
    };
    if fits {
        column_type.to_data_type()
    } else {
        DataType::Float64
    }
}

impl ColumnTransform for FillMissing {
    fn name(&self) -> &'static str {
        "fill_missing"
    }

    fn input_schema(&self) -> &SchemaRef {
        &self.input_schema
    }

    fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    fn apply(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        check_input(self.name(), &self.input_schema, batch)?;
        let mut arrays: Vec<ArrayRef> = batch.columns().to_vec();
        for column in &self.columns {
            arrays[column.index] = self.fill_array(column, batch.column(column.index))?;
        }
        Ok(RecordBatch::try_new(self.output_schema.clone(), arrays)?)
    }
}

// ============================================================================
// Normalize
// ============================================================================

#[derive(Debug, Clone)]
struct NormalizeColumn {
    index: usize,
    name: String,
    mean: f64,
    std: f64,
}

/// Standardizes numeric columns: `(x - mean) / (std + epsilon)`.
///
/// Output columns are float64; nulls stay null.
#[derive(Debug, Clone)]
pub struct Normalize {
    input_schema: SchemaRef,
    output_schema: SchemaRef,
    columns: Vec<NormalizeColumn>,
    epsilon: f64,
}

impl Normalize {
    pub fn new(
        columns: &[String],
        statistics: &Statistics,
        input_schema: SchemaRef,
        epsilon: f64,
    ) -> Result<Self> {
        reject_duplicates(columns)?;
        if !(epsilon >= 0.0 && epsilon.is_finite()) {
            return Err(PrepError::validation(format!(
                "Normalize epsilon must be a finite value >= 0, got {}",
                epsilon
            )));
        }

        let mut norm_columns = Vec::with_capacity(columns.len());
        let mut replacements = Vec::with_capacity(columns.len());
        for column in columns {
            let (index, _) = numeric_column(&input_schema, column)?;
            let stats = statistics.require(column)?;
            let nullable = input_schema.field(index).is_nullable();
            replacements.push((index, Field::new(column, DataType::Float64, nullable)));
            norm_columns.push(NormalizeColumn {
                index,
                name: column.clone(),
                mean: stats.mean,
                std: stats.std,
            });
        }

        Ok(Self {
            output_schema: replace_fields(&input_schema, &replacements),
            input_schema,
            columns: norm_columns,
            epsilon,
        })
    }

    fn params(&self, column: &str) -> Result<&NormalizeColumn> {
        self.columns
            .iter()
            .find(|c| c.name == column)
            .ok_or_else(|| PrepError::validation(format!("Column '{}' is not normalized", column)))
    }

    /// `(mean, std)` used for `column`.
    pub fn scale(&self, column: &str) -> Result<(f64, f64)> {
        self.params(column).map(|c| (c.mean, c.std))
    }

    pub fn normalize(&self, column: &str, x: f64) -> Result<f64> {
        let c = self.params(column)?;
        Ok((x - c.mean) / (c.std + self.epsilon))
    }

    /// Inverse scaling: `y * (std + epsilon) + mean`.
    pub fn denormalize(&self, column: &str, y: f64) -> Result<f64> {
        let c = self.params(column)?;
        Ok(y * (c.std + self.epsilon) + c.mean)
    }
}

impl ColumnTransform for Normalize {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn input_schema(&self) -> &SchemaRef {
        &self.input_schema
    }

    fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    fn apply(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        check_input(self.name(), &self.input_schema, batch)?;
        let mut arrays: Vec<ArrayRef> = batch.columns().to_vec();
        for column in &self.columns {
            let values = cast(batch.column(column.index), &DataType::Float64)?;
            let values = values
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| PrepError::validation("Float64 cast produced an unexpected array"))?;
            let (mean, denom) = (column.mean, column.std + self.epsilon);
            let normalized: Float64Array = values.unary::<_, Float64Type>(|x| (x - mean) / denom);
            arrays[column.index] = Arc::new(normalized);
        }
        Ok(RecordBatch::try_new(self.output_schema.clone(), arrays)?)
    }
}
