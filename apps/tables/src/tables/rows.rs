//! Per-request row validator and CRUD adapter, built from the field list
//! currently stored for a table.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::tables::definition::TableDefinition;
use crate::tables::physical::{PhysicalStore, PhysicalStoreError};
use crate::tables::registry::STRING_MAX_CHARS;
use crate::tables::types::{CellValue, FieldErrors, FieldType, RowId, push_field_error};

pub const STRING_VALUE_MIN_CHARS: usize = 3;
pub const NON_FIELD_ERRORS_KEY: &str = "non_field_errors";

/// A payload that passed validation, as (physical column, value) pairs in
/// field order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRow {
    cells: Vec<(String, CellValue)>,
}

impl ValidatedRow {
    pub fn from_cells(cells: Vec<(String, CellValue)>) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[(String, CellValue)] {
        &self.cells
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("row payload failed validation")]
pub struct RowValidationError {
    pub errors: FieldErrors,
}

#[derive(Debug, thiserror::Error)]
pub enum RowAccessError {
    #[error(transparent)]
    Validation(#[from] RowValidationError),
    #[error("Exceeded max rows allowed ({max_rows}).")]
    RowLimitExceeded { max_rows: u64 },
    #[error(transparent)]
    Store(#[from] PhysicalStoreError),
}

#[derive(Clone)]
pub struct RowAccessor {
    definition: TableDefinition,
    physical: Arc<dyn PhysicalStore>,
    max_rows: u64,
}

impl RowAccessor {
    pub fn build(
        definition: TableDefinition,
        physical: Arc<dyn PhysicalStore>,
        max_rows: u64,
    ) -> Self {
        Self {
            definition,
            physical,
            max_rows,
        }
    }

    pub fn definition(&self) -> &TableDefinition {
        &self.definition
    }

    /// Every field is required and checked against its type; keys that are
    /// not fields of the table are ignored. All problems are reported at once.
    pub fn validate(&self, payload: &Value) -> Result<ValidatedRow, RowValidationError> {
        let mut errors = FieldErrors::new();
        let Some(object) = payload.as_object() else {
            push_field_error(
                &mut errors,
                NON_FIELD_ERRORS_KEY,
                format!(
                    "Invalid data. Expected a dictionary, but got {}.",
                    json_kind(payload)
                ),
            );
            return Err(RowValidationError { errors });
        };

        let mut cells = Vec::with_capacity(self.definition.columns().len());
        for (field, column) in self.definition.entries() {
            let parsed = match object.get(&field.title) {
                None => Err("This field is required.".to_string()),
                Some(Value::Null) => Err("This field may not be null.".to_string()),
                Some(value) => parse_cell(field.field_type, value),
            };
            match parsed {
                Ok(cell) => cells.push((column.name.clone(), cell)),
                Err(message) => push_field_error(&mut errors, field.title.as_str(), message),
            }
        }

        if errors.is_empty() {
            Ok(ValidatedRow { cells })
        } else {
            Err(RowValidationError { errors })
        }
    }

    /// Soft quota: the count check and the insert are separate statements, so
    /// concurrent writers may overshoot the ceiling slightly.
    pub async fn insert(&self, row: &ValidatedRow) -> Result<RowId, RowAccessError> {
        let table_name = self.definition.table_name();
        let count = self.physical.count_rows(table_name).await?;
        if count >= self.max_rows {
            tracing::info!(
                table = self.definition.name(),
                physical_table = table_name,
                count,
                max_rows = self.max_rows,
                "row limit reached; rejecting insert"
            );
            return Err(RowAccessError::RowLimitExceeded {
                max_rows: self.max_rows,
            });
        }
        let id = self.physical.insert_row(table_name, row).await?;
        tracing::debug!(
            table = self.definition.name(),
            physical_table = table_name,
            row_id = id,
            "row inserted"
        );
        Ok(id)
    }

    /// Rows keyed by live field titles, in field-list order.
    pub async fn list_all(&self, limit: usize) -> Result<Vec<Map<String, Value>>, RowAccessError> {
        let rows = self.physical.list_rows(&self.definition, limit).await?;
        Ok(rows
            .into_iter()
            .map(|cells| {
                self.definition
                    .fields()
                    .iter()
                    .zip(cells)
                    .map(|(field, cell)| {
                        let value = cell.as_ref().map_or(Value::Null, CellValue::to_json);
                        (field.title.clone(), value)
                    })
                    .collect::<Map<_, _>>()
            })
            .collect())
    }
}

fn parse_cell(field_type: FieldType, value: &Value) -> Result<CellValue, String> {
    match field_type {
        FieldType::String => parse_string(value).map(CellValue::Text),
        FieldType::Number => parse_integer(value).map(CellValue::Integer),
        FieldType::Boolean => parse_boolean(value).map(CellValue::Boolean),
    }
}

fn parse_string(value: &Value) -> Result<String, String> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => return Err("Not a valid string.".to_string()),
    };
    let length = text.chars().count();
    if length == 0 {
        return Err("This field may not be blank.".to_string());
    }
    if length < STRING_VALUE_MIN_CHARS {
        return Err(format!(
            "Ensure this field has at least {STRING_VALUE_MIN_CHARS} characters."
        ));
    }
    if length > STRING_MAX_CHARS as usize {
        return Err(format!(
            "Ensure this field has no more than {STRING_MAX_CHARS} characters."
        ));
    }
    Ok(text)
}

fn parse_integer(value: &Value) -> Result<i32, String> {
    const INVALID: &str = "A valid integer is required.";
    let wide = match value {
        Value::Number(number) => match number.as_i64() {
            Some(value) => value,
            None => match number.as_f64() {
                Some(float) if float.fract() == 0.0 && float.is_finite() => {
                    if float > i64::MAX as f64 || float < i64::MIN as f64 {
                        return Err(out_of_range(float > 0.0));
                    }
                    float as i64
                }
                _ => return Err(INVALID.to_string()),
            },
        },
        Value::String(text) => {
            let trimmed = text.trim();
            let digits = match trimmed.split_once('.') {
                Some((whole, fraction)) if fraction.chars().all(|ch| ch == '0') => whole,
                Some(_) => return Err(INVALID.to_string()),
                None => trimmed,
            };
            digits.parse::<i64>().map_err(|_| INVALID.to_string())?
        }
        _ => return Err(INVALID.to_string()),
    };
    i32::try_from(wide).map_err(|_| out_of_range(wide > 0))
}

fn out_of_range(too_large: bool) -> String {
    if too_large {
        format!("Ensure this value is less than or equal to {}.", i32::MAX)
    } else {
        format!("Ensure this value is greater than or equal to {}.", i32::MIN)
    }
}

fn parse_boolean(value: &Value) -> Result<bool, String> {
    const INVALID: &str = "Must be a valid boolean.";
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::Number(number) => match number.as_f64() {
            Some(one) if one == 1.0 => Ok(true),
            Some(zero) if zero == 0.0 => Ok(false),
            _ => Err(INVALID.to_string()),
        },
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "t" | "y" | "yes" | "true" | "on" | "1" => Ok(true),
            "f" | "n" | "no" | "false" | "off" | "0" => Ok(false),
            _ => Err(INVALID.to_string()),
        },
        _ => Err(INVALID.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}
