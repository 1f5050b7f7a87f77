use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::tables::definition::{
    DefinitionBuilder, DefinitionError, PhysicalColumn, TableDefinition,
};
use crate::tables::migrator::{MigrationError, SchemaMigrator};
use crate::tables::physical::{PhysicalStore, PhysicalStoreError};
use crate::tables::resolver::TableExistenceResolver;
use crate::tables::rows::{RowAccessError, RowAccessor};
use crate::tables::store::{MetadataStoreError, SchemaMetadataStore};
use crate::tables::types::{
    FieldErrors, FieldType, RowId, SchemaMetadataRecord, TableSchema, TableSchemaRequest,
    push_field_error,
};
use crate::tables::validation::{SchemaValidationError, validate_schema_request};

#[derive(Debug, thiserror::Error)]
pub enum TablesError {
    #[error("invalid input")]
    Validation(FieldErrors),
    #[error("Maximum of {max_fields} fields allowed.")]
    TooManyFields { max_fields: usize },
    #[error("Maximum of {max_tables} tables allowed.")]
    TooManyTables { max_tables: u64 },
    #[error("Exceeded max rows allowed ({max_rows}).")]
    RowLimitExceeded { max_rows: u64 },
    #[error("Changing the type of field \"{title}\" from {current} to {desired} is not allowed.")]
    FieldTypeChangeNotAllowed {
        title: String,
        current: FieldType,
        desired: FieldType,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(String),
}

impl TablesError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request",
            Self::TooManyFields { .. } => "too_many_fields",
            Self::TooManyTables { .. } => "too_many_tables",
            Self::RowLimitExceeded { .. } => "row_limit_exceeded",
            Self::FieldTypeChangeNotAllowed { .. } => "field_type_change_not_allowed",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Store(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Validation(_) => "Invalid input.".to_string(),
            Self::Conflict(message) | Self::NotFound(message) | Self::Store(message) => {
                message.clone()
            }
            other => other.to_string(),
        }
    }

    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            Self::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

impl From<SchemaValidationError> for TablesError {
    fn from(error: SchemaValidationError) -> Self {
        match error {
            SchemaValidationError::TooManyFields { max_fields } => {
                Self::TooManyFields { max_fields }
            }
            SchemaValidationError::Invalid(errors) => Self::Validation(errors),
        }
    }
}

impl From<PhysicalStoreError> for TablesError {
    fn from(error: PhysicalStoreError) -> Self {
        match error {
            PhysicalStoreError::Conflict(message) => Self::Conflict(message),
            // Metadata already resolved the table, so a missing relation or
            // column is divergence, not a client error.
            PhysicalStoreError::NotFound(message) | PhysicalStoreError::Db(message) => {
                Self::Store(message)
            }
        }
    }
}

impl From<MetadataStoreError> for TablesError {
    fn from(error: MetadataStoreError) -> Self {
        match error {
            MetadataStoreError::Conflict(message) => Self::Conflict(message),
            MetadataStoreError::NotFound(message) => Self::NotFound(message),
            MetadataStoreError::Db(message) => Self::Store(message),
        }
    }
}

impl From<MigrationError> for TablesError {
    fn from(error: MigrationError) -> Self {
        match error {
            MigrationError::FieldTypeChangeNotAllowed {
                title,
                current,
                desired,
            } => Self::FieldTypeChangeNotAllowed {
                title,
                current,
                desired,
            },
            MigrationError::TableMismatch { .. } => Self::Store(error.to_string()),
            MigrationError::Store(error) => error.into(),
        }
    }
}

impl From<RowAccessError> for TablesError {
    fn from(error: RowAccessError) -> Self {
        match error {
            RowAccessError::Validation(error) => Self::Validation(error.errors),
            RowAccessError::RowLimitExceeded { max_rows } => Self::RowLimitExceeded { max_rows },
            RowAccessError::Store(error) => error.into(),
        }
    }
}

impl From<DefinitionError> for TablesError {
    fn from(error: DefinitionError) -> Self {
        match error {
            DefinitionError::InvalidFieldType { ref title, .. } => {
                let mut errors = FieldErrors::new();
                push_field_error(&mut errors, title.as_str(), error.to_string());
                Self::Validation(errors)
            }
            DefinitionError::InvalidPrefix(_) => Self::Store(error.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TablePolicyConfig {
    pub max_fields_per_table: usize,
    pub max_rows_per_table: u64,
    pub max_tables_per_owner: u64,
    pub row_page_size: usize,
}

impl Default for TablePolicyConfig {
    fn default() -> Self {
        Self {
            max_fields_per_table: 10,
            max_rows_per_table: 10,
            max_tables_per_owner: 10,
            row_page_size: 1_000,
        }
    }
}

type TableKey = (String, String);

/// Request-scoped orchestration: every call rebuilds definitions and row
/// accessors from the stored field list, so nothing here caches schemas.
#[derive(Clone)]
pub struct TablesService {
    metadata: Arc<dyn SchemaMetadataStore>,
    physical: Arc<dyn PhysicalStore>,
    builder: DefinitionBuilder,
    resolver: TableExistenceResolver,
    migrator: SchemaMigrator,
    policy: TablePolicyConfig,
    table_locks: Arc<Mutex<HashMap<TableKey, Arc<Mutex<()>>>>>,
}

impl TablesService {
    pub fn new(
        metadata: Arc<dyn SchemaMetadataStore>,
        physical: Arc<dyn PhysicalStore>,
        builder: DefinitionBuilder,
    ) -> Self {
        Self::new_with_policy(metadata, physical, builder, TablePolicyConfig::default())
    }

    pub fn new_with_policy(
        metadata: Arc<dyn SchemaMetadataStore>,
        physical: Arc<dyn PhysicalStore>,
        builder: DefinitionBuilder,
        policy: TablePolicyConfig,
    ) -> Self {
        Self {
            resolver: TableExistenceResolver::new(physical.clone()),
            migrator: SchemaMigrator::new(physical.clone()),
            metadata,
            physical,
            builder,
            policy,
            table_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> &TablePolicyConfig {
        &self.policy
    }

    /// Creates the physical table and its metadata record.
    pub async fn define_table(
        &self,
        owner_id: &str,
        request: &TableSchemaRequest,
    ) -> Result<SchemaMetadataRecord, TablesError> {
        let schema = validate_schema_request(request, self.policy.max_fields_per_table)?;
        let name = schema.name.clone();
        self.with_table_lock(owner_id, &name, self.create_locked(owner_id, schema))
            .await
    }

    /// Migrates the physical table to the requested field list, then replaces
    /// the stored list. A rejected plan touches neither.
    pub async fn replace_table(
        &self,
        owner_id: &str,
        table_name: &str,
        request: &TableSchemaRequest,
    ) -> Result<SchemaMetadataRecord, TablesError> {
        let schema = validate_schema_request(request, self.policy.max_fields_per_table)?;
        if schema.name != table_name {
            let mut errors = FieldErrors::new();
            push_field_error(
                &mut errors,
                "name",
                format!("Must match the table being updated (\"{table_name}\")."),
            );
            return Err(TablesError::Validation(errors));
        }
        self.load_record(owner_id, table_name).await?;

        self.with_table_lock(owner_id, table_name, self.replace_locked(owner_id, schema))
            .await
    }

    async fn create_locked(
        &self,
        owner_id: &str,
        schema: TableSchema,
    ) -> Result<SchemaMetadataRecord, TablesError> {
        let owned = self.metadata.count_for_owner(owner_id).await?;
        if owned >= self.policy.max_tables_per_owner {
            tracing::info!(
                owner_id,
                owned,
                max_tables = self.policy.max_tables_per_owner,
                "table limit reached; rejecting create"
            );
            return Err(TablesError::TooManyTables {
                max_tables: self.policy.max_tables_per_owner,
            });
        }

        let definition = self.builder.build(owner_id, &schema.name, &schema.fields)?;
        if self.resolver.exists(&definition).await? {
            return Err(TablesError::Conflict(format!(
                "table `{}` already exists",
                schema.name
            )));
        }
        self.physical
            .create_table(&definition)
            .await
            .map_err(|error| match error {
                PhysicalStoreError::Conflict(_) => {
                    TablesError::Conflict(format!("table `{}` already exists", schema.name))
                }
                other => other.into(),
            })?;

        let now = Utc::now();
        let record = SchemaMetadataRecord {
            owner_id: owner_id.to_string(),
            table_name: schema.name.clone(),
            fields: schema.fields,
            created_at: now,
            updated_at: now,
        };
        if let Err(error) = self.metadata.insert(record.clone()).await {
            self.drop_orphan(&definition).await;
            return Err(error.into());
        }

        tracing::info!(
            owner_id,
            table = %record.table_name,
            physical_table = definition.table_name(),
            fields = record.fields.len(),
            "table created"
        );
        Ok(record)
    }

    async fn replace_locked(
        &self,
        owner_id: &str,
        schema: TableSchema,
    ) -> Result<SchemaMetadataRecord, TablesError> {
        let table_name = schema.name.as_str();
        let record = self.load_record(owner_id, table_name).await?;

        let current = self.builder.build(owner_id, table_name, &record.fields)?;
        self.ensure_physical_matches(&current).await?;
        let desired = self.builder.build(owner_id, table_name, &schema.fields)?;
        let plan = self.migrator.migrate(&current, &desired).await?;

        let updated = match self
            .metadata
            .replace_fields(owner_id, table_name, schema.fields.clone(), Utc::now())
            .await
        {
            Ok(updated) => updated,
            Err(error) => {
                tracing::error!(
                    owner_id,
                    table = table_name,
                    dropped = ?plan.dropped_titles(),
                    added = ?plan.added_titles(),
                    reason = %error,
                    "metadata update failed after migration; reverting physical table"
                );
                if let Err(revert) = self.migrator.migrate(&desired, &current).await {
                    tracing::error!(
                        owner_id,
                        table = table_name,
                        physical_table = current.table_name(),
                        reason = %revert,
                        "physical revert failed; table and metadata diverge"
                    );
                }
                return Err(error.into());
            }
        };
        tracing::info!(
            owner_id,
            table = table_name,
            dropped = ?plan.dropped_titles(),
            added = ?plan.added_titles(),
            "table updated"
        );
        Ok(updated)
    }

    /// Refuses to plan against a physical table whose columns no longer
    /// match the stored field list.
    async fn ensure_physical_matches(&self, current: &TableDefinition) -> Result<(), TablesError> {
        let Some(mut actual) = self.physical.describe_columns(current.table_name()).await? else {
            tracing::error!(
                physical_table = current.table_name(),
                "physical table missing for stored schema"
            );
            return Err(TablesError::Store(format!(
                "physical table {} is missing",
                current.table_name()
            )));
        };
        let mut expected = current.columns().to_vec();
        sort_columns(&mut actual);
        sort_columns(&mut expected);
        if actual != expected {
            tracing::error!(
                physical_table = current.table_name(),
                expected = ?expected,
                actual = ?actual,
                "physical columns diverge from stored schema"
            );
            return Err(TablesError::Store(format!(
                "physical table {} diverges from stored schema",
                current.table_name()
            )));
        }
        Ok(())
    }

    pub async fn describe_table(
        &self,
        owner_id: &str,
        table_name: &str,
    ) -> Result<SchemaMetadataRecord, TablesError> {
        self.load_record(owner_id, table_name).await
    }

    pub async fn append_row(
        &self,
        owner_id: &str,
        table_name: &str,
        payload: &Value,
    ) -> Result<RowId, TablesError> {
        let accessor = self.row_accessor(owner_id, table_name).await?;
        let row = accessor.validate(payload).map_err(RowAccessError::from)?;
        let id = accessor.insert(&row).await?;
        tracing::info!(owner_id, table = table_name, row_id = id, "row appended");
        Ok(id)
    }

    pub async fn list_rows(
        &self,
        owner_id: &str,
        table_name: &str,
    ) -> Result<Vec<Map<String, Value>>, TablesError> {
        let accessor = self.row_accessor(owner_id, table_name).await?;
        Ok(accessor.list_all(self.policy.row_page_size).await?)
    }

    async fn row_accessor(
        &self,
        owner_id: &str,
        table_name: &str,
    ) -> Result<RowAccessor, TablesError> {
        let record = self.load_record(owner_id, table_name).await?;
        let definition = self.builder.build(owner_id, table_name, &record.fields)?;
        Ok(RowAccessor::build(
            definition,
            self.physical.clone(),
            self.policy.max_rows_per_table,
        ))
    }

    async fn load_record(
        &self,
        owner_id: &str,
        table_name: &str,
    ) -> Result<SchemaMetadataRecord, TablesError> {
        self.metadata
            .get(owner_id, table_name)
            .await?
            .ok_or_else(|| TablesError::NotFound(format!("table `{table_name}` not found")))
    }

    /// Runs `work` holding the `(owner, table)` lock. The map entry is
    /// removed once no other caller holds or waits on it.
    async fn with_table_lock<T>(
        &self,
        owner_id: &str,
        table_name: &str,
        work: impl Future<Output = Result<T, TablesError>>,
    ) -> Result<T, TablesError> {
        let key = (owner_id.to_string(), table_name.to_string());
        let lock = {
            let mut locks = self.table_locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().await;
            work.await
        };

        let mut locks = self.table_locks.lock().await;
        // One handle in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&key);
        }
        result
    }

    #[cfg(test)]
    pub(crate) async fn tracked_lock_count(&self) -> usize {
        self.table_locks.lock().await.len()
    }

    async fn drop_orphan(&self, definition: &TableDefinition) {
        if !self.builder.namespace().contains(definition.table_name()) {
            return;
        }
        if let Err(error) = self.physical.drop_table(definition.table_name()).await {
            tracing::error!(
                physical_table = definition.table_name(),
                reason = %error,
                "failed to drop physical table after metadata insert failed"
            );
        }
    }
}

fn sort_columns(columns: &mut [PhysicalColumn]) {
    columns.sort_by(|left, right| left.name.cmp(&right.name));
}
