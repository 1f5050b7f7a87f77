use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const NAME_MIN_CHARS: usize = 3;
pub const NAME_MAX_CHARS: usize = 100;
pub const TITLE_MIN_CHARS: usize = 3;
pub const TITLE_MAX_CHARS: usize = 100;

/// Surrogate key assigned by the physical table on insert.
pub type RowId = i64;

/// Validation messages keyed by the offending input path (`name`,
/// `fields.0.title`, or a row field title).
pub type FieldErrors = BTreeMap<String, Vec<String>>;

pub fn push_field_error(
    errors: &mut FieldErrors,
    key: impl Into<String>,
    message: impl Into<String>,
) {
    errors.entry(key.into()).or_default().push(message.into());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub title: String,
}

impl FieldSpec {
    pub fn new(field_type: FieldType, title: impl Into<String>) -> Self {
        Self {
            field_type,
            title: title.into(),
        }
    }
}

/// A schema payload that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

/// Raw define/replace payload. Everything is optional here so that missing
/// keys surface as field-level validation messages instead of a body
/// rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSchemaRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub fields: Option<Vec<FieldSpecInput>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldSpecInput {
    #[serde(rename = "type", default)]
    pub field_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl FieldSpecInput {
    pub fn new(field_type: &str, title: &str) -> Self {
        Self {
            field_type: Some(field_type.to_string()),
            title: Some(title.to_string()),
        }
    }
}

impl TableSchemaRequest {
    pub fn new(name: &str, fields: Vec<FieldSpecInput>) -> Self {
        Self {
            name: Some(name.to_string()),
            fields: Some(fields),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMetadataRecord {
    pub owner_id: String,
    pub table_name: String,
    pub fields: Vec<FieldSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single non-null cell, typed by the field it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Text(String),
    Integer(i32),
    Boolean(bool),
}

impl CellValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Text(value) => serde_json::Value::String(value.clone()),
            Self::Integer(value) => serde_json::Value::from(*value),
            Self::Boolean(value) => serde_json::Value::Bool(*value),
        }
    }
}

/// One stored row as read back, cells ordered like the definition's columns.
/// `None` marks a NULL cell, which only occurs in rows written before the
/// column was added.
pub type StoredRow = Vec<Option<CellValue>>;

#[derive(Debug, Clone, Serialize)]
pub struct TableMutationResponse {
    pub message: String,
    pub table: SchemaMetadataRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowCreatedResponse {
    pub message: String,
    pub id: RowId,
}
