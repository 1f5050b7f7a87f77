use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::Row;

use crate::db::TablesDb;
use crate::tables::types::{FieldSpec, SchemaMetadataRecord};

#[derive(Debug, thiserror::Error)]
pub enum MetadataStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Authoritative field list per (owner, table name). The physical table is a
/// projection of this record.
#[async_trait]
pub trait SchemaMetadataStore: Send + Sync {
    async fn get(
        &self,
        owner_id: &str,
        table_name: &str,
    ) -> Result<Option<SchemaMetadataRecord>, MetadataStoreError>;

    async fn count_for_owner(&self, owner_id: &str) -> Result<u64, MetadataStoreError>;

    /// Fails with `Conflict` when a record for the same key exists.
    async fn insert(&self, record: SchemaMetadataRecord) -> Result<(), MetadataStoreError>;

    async fn replace_fields(
        &self,
        owner_id: &str,
        table_name: &str,
        fields: Vec<FieldSpec>,
        now: DateTime<Utc>,
    ) -> Result<SchemaMetadataRecord, MetadataStoreError>;
}

pub fn memory() -> Arc<dyn SchemaMetadataStore> {
    Arc::new(MemorySchemaMetadataStore::default())
}

pub fn postgres(db: Arc<TablesDb>) -> Arc<dyn SchemaMetadataStore> {
    Arc::new(PostgresSchemaMetadataStore { db })
}

#[derive(Default)]
struct MemorySchemaMetadataStore {
    records: Mutex<HashMap<(String, String), SchemaMetadataRecord>>,
}

#[async_trait]
impl SchemaMetadataStore for MemorySchemaMetadataStore {
    async fn get(
        &self,
        owner_id: &str,
        table_name: &str,
    ) -> Result<Option<SchemaMetadataRecord>, MetadataStoreError> {
        let records = self.records.lock().await;
        Ok(records
            .get(&(owner_id.to_string(), table_name.to_string()))
            .cloned())
    }

    async fn count_for_owner(&self, owner_id: &str) -> Result<u64, MetadataStoreError> {
        let records = self.records.lock().await;
        Ok(records.keys().filter(|(owner, _)| owner == owner_id).count() as u64)
    }

    async fn insert(&self, record: SchemaMetadataRecord) -> Result<(), MetadataStoreError> {
        let mut records = self.records.lock().await;
        let key = (record.owner_id.clone(), record.table_name.clone());
        if records.contains_key(&key) {
            return Err(MetadataStoreError::Conflict(format!(
                "schema `{}` already exists",
                record.table_name
            )));
        }
        records.insert(key, record);
        Ok(())
    }

    async fn replace_fields(
        &self,
        owner_id: &str,
        table_name: &str,
        fields: Vec<FieldSpec>,
        now: DateTime<Utc>,
    ) -> Result<SchemaMetadataRecord, MetadataStoreError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&(owner_id.to_string(), table_name.to_string())) else {
            return Err(MetadataStoreError::NotFound("schema".to_string()));
        };
        record.fields = fields;
        record.updated_at = now;
        Ok(record.clone())
    }
}

struct PostgresSchemaMetadataStore {
    db: Arc<TablesDb>,
}

#[async_trait]
impl SchemaMetadataStore for PostgresSchemaMetadataStore {
    async fn get(
        &self,
        owner_id: &str,
        table_name: &str,
    ) -> Result<Option<SchemaMetadataRecord>, MetadataStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT owner_id, table_name, fields, created_at, updated_at
                  FROM dynamic_tables.schema_metadata
                 WHERE owner_id = $1 AND table_name = $2
                "#,
                &[&owner_id, &table_name],
            )
            .await
            .map_err(|error| MetadataStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_record_row)
            .transpose()
            .map_err(MetadataStoreError::Db)
    }

    async fn count_for_owner(&self, owner_id: &str) -> Result<u64, MetadataStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                SELECT COUNT(*) AS total
                  FROM dynamic_tables.schema_metadata
                 WHERE owner_id = $1
                "#,
                &[&owner_id],
            )
            .await
            .map_err(|error| MetadataStoreError::Db(error.to_string()))?;
        let total: i64 = row.get("total");
        Ok(total.max(0) as u64)
    }

    async fn insert(&self, record: SchemaMetadataRecord) -> Result<(), MetadataStoreError> {
        let fields = serde_json::to_value(&record.fields)
            .map_err(|error| MetadataStoreError::Db(error.to_string()))?;
        let client = self.db.client();
        let client = client.lock().await;
        let inserted = client
            .execute(
                r#"
                INSERT INTO dynamic_tables.schema_metadata (
                    owner_id, table_name, fields, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (owner_id, table_name) DO NOTHING
                "#,
                &[
                    &record.owner_id,
                    &record.table_name,
                    &fields,
                    &record.created_at,
                    &record.updated_at,
                ],
            )
            .await
            .map_err(|error| MetadataStoreError::Db(error.to_string()))?;
        if inserted == 0 {
            return Err(MetadataStoreError::Conflict(format!(
                "schema `{}` already exists",
                record.table_name
            )));
        }
        Ok(())
    }

    async fn replace_fields(
        &self,
        owner_id: &str,
        table_name: &str,
        fields: Vec<FieldSpec>,
        now: DateTime<Utc>,
    ) -> Result<SchemaMetadataRecord, MetadataStoreError> {
        let fields = serde_json::to_value(&fields)
            .map_err(|error| MetadataStoreError::Db(error.to_string()))?;
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                UPDATE dynamic_tables.schema_metadata
                   SET fields = $3, updated_at = $4
                 WHERE owner_id = $1 AND table_name = $2
             RETURNING owner_id, table_name, fields, created_at, updated_at
                "#,
                &[&owner_id, &table_name, &fields, &now],
            )
            .await
            .map_err(|error| MetadataStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Err(MetadataStoreError::NotFound("schema".to_string()));
        };
        map_record_row(&row).map_err(MetadataStoreError::Db)
    }
}

fn map_record_row(row: &Row) -> Result<SchemaMetadataRecord, String> {
    let fields: serde_json::Value = row.get("fields");
    let fields = serde_json::from_value::<Vec<FieldSpec>>(fields)
        .map_err(|error| format!("invalid stored field list: {error}"))?;
    Ok(SchemaMetadataRecord {
        owner_id: row.get("owner_id"),
        table_name: row.get("table_name"),
        fields,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
