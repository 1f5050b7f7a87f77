//! Title-keyed schema diff between two table definitions.
//!
//! A plan is computed in full before anything is applied, so a rejected
//! type change leaves the physical table untouched. Drops come first (in
//! current field order), then adds (in desired field order); the whole plan
//! is applied by the physical store as one transaction.

use std::collections::HashMap;
use std::sync::Arc;

use crate::tables::definition::{PhysicalColumn, TableDefinition};
use crate::tables::physical::{PhysicalStore, PhysicalStoreError};
use crate::tables::types::{FieldSpec, FieldType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaOperation {
    DropColumn {
        title: String,
        column: PhysicalColumn,
    },
    AddColumn {
        field: FieldSpec,
        column: PhysicalColumn,
    },
}

impl SchemaOperation {
    pub fn column(&self) -> &PhysicalColumn {
        match self {
            Self::DropColumn { column, .. } | Self::AddColumn { column, .. } => column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    table_name: String,
    operations: Vec<SchemaOperation>,
}

impl MigrationPlan {
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn operations(&self) -> &[SchemaOperation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn dropped_titles(&self) -> Vec<&str> {
        self.operations
            .iter()
            .filter_map(|operation| match operation {
                SchemaOperation::DropColumn { title, .. } => Some(title.as_str()),
                SchemaOperation::AddColumn { .. } => None,
            })
            .collect()
    }

    pub fn added_titles(&self) -> Vec<&str> {
        self.operations
            .iter()
            .filter_map(|operation| match operation {
                SchemaOperation::AddColumn { field, .. } => Some(field.title.as_str()),
                SchemaOperation::DropColumn { .. } => None,
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("changing type of field `{title}` from {current} to {desired} is not allowed")]
    FieldTypeChangeNotAllowed {
        title: String,
        current: FieldType,
        desired: FieldType,
    },
    #[error("cannot migrate `{current}` into a different table `{desired}`")]
    TableMismatch { current: String, desired: String },
    #[error(transparent)]
    Store(#[from] PhysicalStoreError),
}

/// Diffs `current` against `desired`. Pure; emits one diagnostic event per
/// scheduled operation.
pub fn plan_migration(
    current: &TableDefinition,
    desired: &TableDefinition,
) -> Result<MigrationPlan, MigrationError> {
    if current.table_name() != desired.table_name() {
        return Err(MigrationError::TableMismatch {
            current: current.table_name().to_string(),
            desired: desired.table_name().to_string(),
        });
    }

    let desired_by_title = desired
        .fields()
        .iter()
        .map(|field| (field.title.as_str(), field))
        .collect::<HashMap<_, _>>();
    let current_by_title = current
        .fields()
        .iter()
        .map(|field| (field.title.as_str(), field))
        .collect::<HashMap<_, _>>();

    let mut operations = Vec::new();

    for (field, column) in current.entries() {
        match desired_by_title.get(field.title.as_str()) {
            None => {
                tracing::info!(
                    table = current.table_name(),
                    field = %field.title,
                    column = %column.name,
                    field_type = field.field_type.as_str(),
                    "scheduling drop column"
                );
                operations.push(SchemaOperation::DropColumn {
                    title: field.title.clone(),
                    column: column.clone(),
                });
            }
            Some(wanted) if wanted.field_type != field.field_type => {
                tracing::warn!(
                    table = current.table_name(),
                    field = %field.title,
                    current_type = field.field_type.as_str(),
                    desired_type = wanted.field_type.as_str(),
                    "rejecting field type change"
                );
                return Err(MigrationError::FieldTypeChangeNotAllowed {
                    title: field.title.clone(),
                    current: field.field_type,
                    desired: wanted.field_type,
                });
            }
            Some(_) => {}
        }
    }

    for (field, column) in desired.entries() {
        if current_by_title.contains_key(field.title.as_str()) {
            continue;
        }
        tracing::info!(
            table = desired.table_name(),
            field = %field.title,
            column = %column.name,
            field_type = field.field_type.as_str(),
            "scheduling add column"
        );
        operations.push(SchemaOperation::AddColumn {
            field: field.clone(),
            column: column.clone(),
        });
    }

    Ok(MigrationPlan {
        table_name: current.table_name().to_string(),
        operations,
    })
}

#[derive(Clone)]
pub struct SchemaMigrator {
    physical: Arc<dyn PhysicalStore>,
}

impl SchemaMigrator {
    pub fn new(physical: Arc<dyn PhysicalStore>) -> Self {
        Self { physical }
    }

    /// Plans and applies. On `Ok` the physical change has committed and the
    /// caller may persist `desired.fields()`.
    pub async fn migrate(
        &self,
        current: &TableDefinition,
        desired: &TableDefinition,
    ) -> Result<MigrationPlan, MigrationError> {
        let plan = plan_migration(current, desired)?;
        if plan.is_empty() {
            tracing::debug!(
                table = plan.table_name(),
                "schema unchanged physically; no ddl to apply"
            );
            return Ok(plan);
        }
        self.physical.apply_migration(&plan).await?;
        tracing::info!(
            table = plan.table_name(),
            dropped = plan.dropped_titles().len(),
            added = plan.added_titles().len(),
            "schema migration committed"
        );
        Ok(plan)
    }
}
