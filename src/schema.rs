//! Column types and schema checks shared by every stage.
//!
//! # Supported Column Types
//!
//! | ColumnType | Arrow Type | Numeric |
//! |------------|-----------|---------|
//! | `boolean` | Boolean | No |
//! | `int32` | Int32 | Yes (integer) |
//! | `int64` | Int64 | Yes (integer) |
//! | `uint32` | UInt32 | Yes (integer) |
//! | `uint64` | UInt64 | Yes (integer) |
//! | `float32` | Float32 | Yes |
//! | `float64` | Float64 | Yes |
//! | `utf8` | Utf8 | No |
//! | `large_utf8` | LargeUtf8 | No |

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::{PrepError, Result};

/// Scalar type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Utf8,
    LargeUtf8,
}

impl ColumnType {
    /// Map an Arrow data type to a supported column type.
    pub fn from_data_type(data_type: &DataType) -> Option<Self> {
        match data_type {
            DataType::Boolean => Some(ColumnType::Boolean),
            DataType::Int32 => Some(ColumnType::Int32),
            DataType::Int64 => Some(ColumnType::Int64),
            DataType::UInt32 => Some(ColumnType::UInt32),
            DataType::UInt64 => Some(ColumnType::UInt64),
            DataType::Float32 => Some(ColumnType::Float32),
            DataType::Float64 => Some(ColumnType::Float64),
            DataType::Utf8 => Some(ColumnType::Utf8),
            DataType::LargeUtf8 => Some(ColumnType::LargeUtf8),
            _ => None,
        }
    }

    pub fn to_data_type(self) -> DataType {
        match self {
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Int32 => DataType::Int32,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::UInt32 => DataType::UInt32,
            ColumnType::UInt64 => DataType::UInt64,
            ColumnType::Float32 => DataType::Float32,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
            ColumnType::LargeUtf8 => DataType::LargeUtf8,
        }
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || matches!(self, ColumnType::Float32 | ColumnType::Float64)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ColumnType::Int32 | ColumnType::Int64 | ColumnType::UInt32 | ColumnType::UInt64
        )
    }
}

/// One column of a serialized schema (manifest and dictionary files).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub nullable: bool,
}

/// Serialize an Arrow schema into manifest entries.
pub fn schema_to_entries(schema: &Schema) -> Result<Vec<ColumnEntry>> {
    schema
        .fields()
        .iter()
        .map(|field| {
            let column_type = ColumnType::from_data_type(field.data_type()).ok_or_else(|| {
                PrepError::validation(format!(
                    "Column '{}' has unsupported type {:?}",
                    field.name(),
                    field.data_type()
                ))
            })?;
            Ok(ColumnEntry {
                name: field.name().clone(),
                column_type,
                nullable: field.is_nullable(),
            })
        })
        .collect()
}

/// Rebuild an Arrow schema from manifest entries.
pub fn entries_to_schema(entries: &[ColumnEntry]) -> SchemaRef {
    let fields: Vec<Field> = entries
        .iter()
        .map(|e| Field::new(&e.name, e.column_type.to_data_type(), e.nullable))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Reject schemas that contain types the pipeline cannot carry.
pub fn validate_supported(schema: &Schema, origin: &Path) -> Result<()> {
    for field in schema.fields() {
        if ColumnType::from_data_type(field.data_type()).is_none() {
            return Err(PrepError::format(
                origin,
                format!(
                    "column '{}' has unsupported type {:?}",
                    field.name(),
                    field.data_type()
                ),
            ));
        }
    }
    Ok(())
}

/// Merge `other` into `base`, failing on any name, order or type difference.
///
/// Nullability is OR-ed: a column is nullable in the result when any source
/// declares it nullable.
pub fn unify_schemas(base: &Schema, other: &Schema, origin: &Path) -> Result<SchemaRef> {
    if base.fields().len() != other.fields().len() {
        return Err(PrepError::schema_mismatch(
            origin,
            "<column count>",
            base.fields().len().to_string(),
            other.fields().len().to_string(),
        ));
    }

    let mut fields = Vec::with_capacity(base.fields().len());
    for (expected, actual) in base.fields().iter().zip(other.fields().iter()) {
        if expected.name() != actual.name() {
            return Err(PrepError::schema_mismatch(
                origin,
                expected.name().as_str(),
                format!("column '{}'", expected.name()),
                format!("column '{}'", actual.name()),
            ));
        }
        if expected.data_type() != actual.data_type() {
            return Err(PrepError::schema_mismatch(
                origin,
                expected.name().as_str(),
                format!("{:?}", expected.data_type()),
                format!("{:?}", actual.data_type()),
            ));
        }
        fields.push(Field::new(
            expected.name(),
            expected.data_type().clone(),
            expected.is_nullable() || actual.is_nullable(),
        ));
    }
    Ok(Arc::new(Schema::new(fields)))
}

/// Look up a column, failing with a validation error naming the column.
pub fn column_type(schema: &Schema, column: &str) -> Result<(usize, ColumnType)> {
    let (idx, field) = schema
        .column_with_name(column)
        .ok_or_else(|| PrepError::validation(format!("Column '{}' not found in schema", column)))?;
    let column_type = ColumnType::from_data_type(field.data_type()).ok_or_else(|| {
        PrepError::validation(format!(
            "Column '{}' has unsupported type {:?}",
            column,
            field.data_type()
        ))
    })?;
    Ok((idx, column_type))
}

/// Look up a column that must be numeric.
pub fn numeric_column(schema: &Schema, column: &str) -> Result<(usize, ColumnType)> {
    let (idx, column_type) = column_type(schema, column)?;
    if !column_type.is_numeric() {
        return Err(PrepError::validation(format!(
            "Column '{}' must be numeric, got {:?}",
            column, column_type
        )));
    }
    Ok((idx, column_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn schema(fields: Vec<(&str, DataType, bool)>) -> Schema {
        Schema::new(
            fields
                .into_iter()
                .map(|(n, t, null)| Field::new(n, t, null))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_column_type_round_trip_through_data_type() {
        for ct in [
            ColumnType::Boolean,
            ColumnType::Int32,
            ColumnType::Int64,
            ColumnType::UInt32,
            ColumnType::UInt64,
            ColumnType::Float32,
            ColumnType::Float64,
            ColumnType::Utf8,
            ColumnType::LargeUtf8,
        ] {
            assert_eq!(ColumnType::from_data_type(&ct.to_data_type()), Some(ct));
        }
        assert_eq!(ColumnType::from_data_type(&DataType::Date32), None);
    }

    #[test]
    fn test_unify_ors_nullability() {
        let a = schema(vec![("x", DataType::Int64, false)]);
        let b = schema(vec![("x", DataType::Int64, true)]);
        let unified = unify_schemas(&a, &b, &PathBuf::from("b.parquet")).unwrap();
        assert!(unified.field(0).is_nullable());
    }

    #[test]
    fn test_unify_rejects_type_change() {
        let a = schema(vec![("x", DataType::Int64, false)]);
        let b = schema(vec![("x", DataType::Float64, false)]);
        let err = unify_schemas(&a, &b, &PathBuf::from("b.parquet")).unwrap_err();
        match err {
            PrepError::SchemaMismatch { column, .. } => assert_eq!(column, "x"),
            other => panic!("Expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_unify_rejects_renamed_column() {
        let a = schema(vec![("x", DataType::Int64, false)]);
        let b = schema(vec![("y", DataType::Int64, false)]);
        assert!(matches!(
            unify_schemas(&a, &b, &PathBuf::from("b.parquet")),
            Err(PrepError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_entries_round_trip() {
        let s = schema(vec![
            ("id", DataType::UInt64, false),
            ("name", DataType::Utf8, true),
        ]);
        let entries = schema_to_entries(&s).unwrap();
        assert_eq!(entries[1].column_type, ColumnType::Utf8);
        let rebuilt = entries_to_schema(&entries);
        assert_eq!(rebuilt.as_ref(), &s);
    }

    #[test]
    fn test_numeric_column_rejects_strings() {
        let s = schema(vec![("name", DataType::Utf8, true)]);
        assert!(numeric_column(&s, "name").is_err());
        assert!(numeric_column(&s, "missing").is_err());
    }
}
