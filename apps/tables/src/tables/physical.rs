use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;

use crate::db::TablesDb;
use crate::tables::definition::{PhysicalColumn, ROW_ID_COLUMN, TableDefinition, quote_identifier};
use crate::tables::migrator::{MigrationPlan, SchemaOperation};
use crate::tables::registry::PhysicalType;
use crate::tables::rows::ValidatedRow;
use crate::tables::types::{CellValue, FieldType, RowId, StoredRow};

#[derive(Debug, thiserror::Error)]
pub enum PhysicalStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

/// The relational store holding the dynamic tables themselves.
#[async_trait]
pub trait PhysicalStore: Send + Sync {
    /// Catalog introspection; the ground truth for "does this table exist".
    async fn table_exists(&self, table_name: &str) -> Result<bool, PhysicalStoreError>;

    /// Field columns of a table in physical order, excluding the row id.
    async fn describe_columns(
        &self,
        table_name: &str,
    ) -> Result<Option<Vec<PhysicalColumn>>, PhysicalStoreError>;

    /// Fails with `Conflict` when the table already exists.
    async fn create_table(&self, definition: &TableDefinition) -> Result<(), PhysicalStoreError>;

    async fn drop_table(&self, table_name: &str) -> Result<(), PhysicalStoreError>;

    /// Applies every operation or none of them.
    async fn apply_migration(&self, plan: &MigrationPlan) -> Result<(), PhysicalStoreError>;

    async fn count_rows(&self, table_name: &str) -> Result<u64, PhysicalStoreError>;

    async fn insert_row(
        &self,
        table_name: &str,
        row: &ValidatedRow,
    ) -> Result<RowId, PhysicalStoreError>;

    /// Rows in insertion order, cells ordered like `definition.columns()`.
    async fn list_rows(
        &self,
        definition: &TableDefinition,
        limit: usize,
    ) -> Result<Vec<StoredRow>, PhysicalStoreError>;
}

pub fn memory() -> Arc<dyn PhysicalStore> {
    Arc::new(MemoryPhysicalStore::default())
}

pub fn postgres(db: Arc<TablesDb>) -> Arc<dyn PhysicalStore> {
    Arc::new(PostgresPhysicalStore { db })
}

#[derive(Default)]
struct MemoryPhysicalStore {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<PhysicalColumn>,
    rows: Vec<MemoryRow>,
    next_id: RowId,
}

#[derive(Debug, Clone)]
struct MemoryRow {
    id: RowId,
    cells: HashMap<String, CellValue>,
}

impl MemoryTable {
    fn apply(&mut self, operation: &SchemaOperation) -> Result<(), PhysicalStoreError> {
        match operation {
            SchemaOperation::DropColumn { column, .. } => {
                let Some(position) = self
                    .columns
                    .iter()
                    .position(|existing| existing.name == column.name)
                else {
                    return Err(PhysicalStoreError::NotFound(format!(
                        "column {} does not exist",
                        column.name
                    )));
                };
                self.columns.remove(position);
                for row in &mut self.rows {
                    row.cells.remove(&column.name);
                }
            }
            SchemaOperation::AddColumn { column, .. } => {
                if self
                    .columns
                    .iter()
                    .any(|existing| existing.name == column.name)
                {
                    return Err(PhysicalStoreError::Conflict(format!(
                        "column {} already exists",
                        column.name
                    )));
                }
                self.columns.push(column.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PhysicalStore for MemoryPhysicalStore {
    async fn table_exists(&self, table_name: &str) -> Result<bool, PhysicalStoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.contains_key(table_name))
    }

    async fn describe_columns(
        &self,
        table_name: &str,
    ) -> Result<Option<Vec<PhysicalColumn>>, PhysicalStoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.get(table_name).map(|table| table.columns.clone()))
    }

    async fn create_table(&self, definition: &TableDefinition) -> Result<(), PhysicalStoreError> {
        let mut tables = self.tables.lock().await;
        if tables.contains_key(definition.table_name()) {
            return Err(PhysicalStoreError::Conflict(format!(
                "relation {} already exists",
                definition.table_name()
            )));
        }
        tables.insert(
            definition.table_name().to_string(),
            MemoryTable {
                columns: definition.columns().to_vec(),
                rows: Vec::new(),
                next_id: 1,
            },
        );
        Ok(())
    }

    async fn drop_table(&self, table_name: &str) -> Result<(), PhysicalStoreError> {
        let mut tables = self.tables.lock().await;
        tables
            .remove(table_name)
            .map(|_| ())
            .ok_or_else(|| PhysicalStoreError::NotFound(format!("relation {table_name}")))
    }

    async fn apply_migration(&self, plan: &MigrationPlan) -> Result<(), PhysicalStoreError> {
        let mut tables = self.tables.lock().await;
        let Some(table) = tables.get(plan.table_name()) else {
            return Err(PhysicalStoreError::NotFound(format!(
                "relation {}",
                plan.table_name()
            )));
        };
        // Stage on a copy; the live table is only replaced once every
        // operation succeeded.
        let mut staged = table.clone();
        for operation in plan.operations() {
            staged.apply(operation)?;
        }
        tables.insert(plan.table_name().to_string(), staged);
        Ok(())
    }

    async fn count_rows(&self, table_name: &str) -> Result<u64, PhysicalStoreError> {
        let tables = self.tables.lock().await;
        tables
            .get(table_name)
            .map(|table| table.rows.len() as u64)
            .ok_or_else(|| PhysicalStoreError::NotFound(format!("relation {table_name}")))
    }

    async fn insert_row(
        &self,
        table_name: &str,
        row: &ValidatedRow,
    ) -> Result<RowId, PhysicalStoreError> {
        let mut tables = self.tables.lock().await;
        let Some(table) = tables.get_mut(table_name) else {
            return Err(PhysicalStoreError::NotFound(format!(
                "relation {table_name}"
            )));
        };
        let mut cells = HashMap::new();
        for (column_name, value) in row.cells() {
            if !table.columns.iter().any(|column| &column.name == column_name) {
                return Err(PhysicalStoreError::Db(format!(
                    "column {column_name} of relation {table_name} does not exist"
                )));
            }
            cells.insert(column_name.clone(), value.clone());
        }
        let id = table.next_id;
        table.next_id += 1;
        table.rows.push(MemoryRow { id, cells });
        Ok(id)
    }

    async fn list_rows(
        &self,
        definition: &TableDefinition,
        limit: usize,
    ) -> Result<Vec<StoredRow>, PhysicalStoreError> {
        let tables = self.tables.lock().await;
        let Some(table) = tables.get(definition.table_name()) else {
            return Err(PhysicalStoreError::NotFound(format!(
                "relation {}",
                definition.table_name()
            )));
        };
        for column in definition.columns() {
            if !table.columns.iter().any(|existing| existing.name == column.name) {
                return Err(PhysicalStoreError::Db(format!(
                    "column {} of relation {} does not exist",
                    column.name,
                    definition.table_name()
                )));
            }
        }
        let mut rows = table.rows.iter().collect::<Vec<_>>();
        rows.sort_by_key(|row| row.id);
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|row| {
                definition
                    .columns()
                    .iter()
                    .map(|column| row.cells.get(&column.name).cloned())
                    .collect()
            })
            .collect())
    }
}

struct PostgresPhysicalStore {
    db: Arc<TablesDb>,
}

fn map_pg_error(error: tokio_postgres::Error) -> PhysicalStoreError {
    match error.code() {
        Some(code) if *code == SqlState::DUPLICATE_TABLE || *code == SqlState::DUPLICATE_COLUMN => {
            PhysicalStoreError::Conflict(error.to_string())
        }
        Some(code) if *code == SqlState::UNDEFINED_TABLE => {
            PhysicalStoreError::NotFound(error.to_string())
        }
        _ => PhysicalStoreError::Db(error.to_string()),
    }
}

fn operation_sql(table_name: &str, operation: &SchemaOperation) -> String {
    match operation {
        SchemaOperation::DropColumn { column, .. } => format!(
            "ALTER TABLE {} DROP COLUMN {}",
            quote_identifier(table_name),
            quote_identifier(&column.name)
        ),
        SchemaOperation::AddColumn { column, .. } => format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_identifier(table_name),
            column.column_sql()
        ),
    }
}

fn parse_physical_type(data_type: &str, max_chars: Option<i32>) -> Result<PhysicalType, String> {
    match data_type {
        "character varying" => {
            let max_chars = max_chars
                .and_then(|value| u32::try_from(value).ok())
                .ok_or_else(|| "varchar column without length".to_string())?;
            Ok(PhysicalType::VarChar { max_chars })
        }
        "integer" => Ok(PhysicalType::Integer),
        "boolean" => Ok(PhysicalType::Boolean),
        other => Err(format!("unsupported column type {other}")),
    }
}

fn cell_param(value: &CellValue) -> &(dyn ToSql + Sync) {
    match value {
        CellValue::Text(value) => value,
        CellValue::Integer(value) => value,
        CellValue::Boolean(value) => value,
    }
}

fn read_cell(
    row: &tokio_postgres::Row,
    index: usize,
    field_type: FieldType,
) -> Result<Option<CellValue>, tokio_postgres::Error> {
    Ok(match field_type {
        FieldType::String => row.try_get::<_, Option<String>>(index)?.map(CellValue::Text),
        FieldType::Number => row.try_get::<_, Option<i32>>(index)?.map(CellValue::Integer),
        FieldType::Boolean => row.try_get::<_, Option<bool>>(index)?.map(CellValue::Boolean),
    })
}

#[async_trait]
impl PhysicalStore for PostgresPhysicalStore {
    async fn table_exists(&self, table_name: &str) -> Result<bool, PhysicalStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                SELECT EXISTS (
                    SELECT 1
                      FROM information_schema.tables
                     WHERE table_schema::text = current_schema()
                       AND table_name::text = $1
                )
                "#,
                &[&table_name],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(row.get(0))
    }

    async fn describe_columns(
        &self,
        table_name: &str,
    ) -> Result<Option<Vec<PhysicalColumn>>, PhysicalStoreError> {
        if !self.table_exists(table_name).await? {
            return Ok(None);
        }
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT column_name::text AS column_name,
                       data_type::text AS data_type,
                       is_nullable::text AS is_nullable,
                       character_maximum_length::int4 AS max_chars
                  FROM information_schema.columns
                 WHERE table_schema::text = current_schema()
                   AND table_name::text = $1
                 ORDER BY ordinal_position
                "#,
                &[&table_name],
            )
            .await
            .map_err(map_pg_error)?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("column_name");
            if name == ROW_ID_COLUMN {
                continue;
            }
            let data_type: String = row.get("data_type");
            let is_nullable: String = row.get("is_nullable");
            let max_chars: Option<i32> = row.get("max_chars");
            let physical_type =
                parse_physical_type(&data_type, max_chars).map_err(PhysicalStoreError::Db)?;
            columns.push(PhysicalColumn {
                name,
                physical_type,
                nullable: is_nullable == "YES",
            });
        }
        Ok(Some(columns))
    }

    async fn create_table(&self, definition: &TableDefinition) -> Result<(), PhysicalStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .batch_execute(&definition.create_table_sql())
            .await
            .map_err(map_pg_error)
    }

    async fn drop_table(&self, table_name: &str) -> Result<(), PhysicalStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .batch_execute(&format!("DROP TABLE {}", quote_identifier(table_name)))
            .await
            .map_err(map_pg_error)
    }

    async fn apply_migration(&self, plan: &MigrationPlan) -> Result<(), PhysicalStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(map_pg_error)?;
        for operation in plan.operations() {
            // An early return drops `tx`, which rolls every prior ALTER back.
            tx.batch_execute(&operation_sql(plan.table_name(), operation))
                .await
                .map_err(map_pg_error)?;
        }
        tx.commit().await.map_err(map_pg_error)
    }

    async fn count_rows(&self, table_name: &str) -> Result<u64, PhysicalStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                &format!("SELECT COUNT(*) FROM {}", quote_identifier(table_name)),
                &[],
            )
            .await
            .map_err(map_pg_error)?;
        let count: i64 = row.get(0);
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn insert_row(
        &self,
        table_name: &str,
        row: &ValidatedRow,
    ) -> Result<RowId, PhysicalStoreError> {
        let columns = row
            .cells()
            .iter()
            .map(|(column_name, _)| quote_identifier(column_name))
            .collect::<Vec<_>>();
        let placeholders = (1..=columns.len())
            .map(|index| format!("${index}"))
            .collect::<Vec<_>>();
        let statement = if columns.is_empty() {
            format!(
                "INSERT INTO {} DEFAULT VALUES RETURNING {}",
                quote_identifier(table_name),
                quote_identifier(ROW_ID_COLUMN)
            )
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
                quote_identifier(table_name),
                columns.join(", "),
                placeholders.join(", "),
                quote_identifier(ROW_ID_COLUMN)
            )
        };
        let params = row
            .cells()
            .iter()
            .map(|(_, value)| cell_param(value))
            .collect::<Vec<_>>();

        let client = self.db.client();
        let client = client.lock().await;
        let inserted = client
            .query_one(&statement, &params)
            .await
            .map_err(map_pg_error)?;
        Ok(inserted.get(0))
    }

    async fn list_rows(
        &self,
        definition: &TableDefinition,
        limit: usize,
    ) -> Result<Vec<StoredRow>, PhysicalStoreError> {
        let columns = definition
            .columns()
            .iter()
            .map(|column| quote_identifier(&column.name))
            .collect::<Vec<_>>();
        let statement = format!(
            "SELECT {} FROM {} ORDER BY {} ASC LIMIT $1",
            columns.join(", "),
            quote_identifier(definition.table_name()),
            quote_identifier(ROW_ID_COLUMN)
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(&statement, &[&limit])
            .await
            .map_err(map_pg_error)?;

        rows.iter()
            .map(|row| {
                definition
                    .fields()
                    .iter()
                    .enumerate()
                    .map(|(index, field)| read_cell(row, index, field.field_type))
                    .collect::<Result<StoredRow, _>>()
                    .map_err(map_pg_error)
            })
            .collect()
    }
}
