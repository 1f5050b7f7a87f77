use sha2::{Digest, Sha256};

use crate::tables::registry::{self, PhysicalType, UnknownFieldType};
use crate::tables::types::FieldSpec;

/// Surrogate primary key present on every dynamic table.
pub const ROW_ID_COLUMN: &str = "id";
/// Postgres truncates identifiers beyond this many bytes.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

const TABLE_SLUG_MAX_CHARS: usize = 24;
const TABLE_HASH_HEX_CHARS: usize = 16;
const COLUMN_HASH_HEX_CHARS: usize = 24;
const PREFIX_MAX_CHARS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("invalid field type for `{title}`: {source}")]
    InvalidFieldType {
        title: String,
        #[source]
        source: UnknownFieldType,
    },
    #[error("invalid table prefix `{0}`: expected [a-z][a-z0-9_]{{0,15}}")]
    InvalidPrefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalColumn {
    pub name: String,
    pub physical_type: PhysicalType,
    pub nullable: bool,
}

impl PhysicalColumn {
    pub fn column_sql(&self) -> String {
        let null_clause = if self.nullable { "NULL" } else { "NOT NULL" };
        format!(
            "{} {} {null_clause}",
            quote_identifier(&self.name),
            self.physical_type.sql()
        )
    }
}

/// In-memory shape of one dynamic table. Built purely from an owner, a name
/// and a field list, so two builds of the same inputs compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    name: String,
    table_name: String,
    fields: Vec<FieldSpec>,
    columns: Vec<PhysicalColumn>,
}

impl TableDefinition {
    /// Logical, owner-supplied name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical table identifier.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn columns(&self) -> &[PhysicalColumn] {
        &self.columns
    }

    pub fn entries(&self) -> impl Iterator<Item = (&FieldSpec, &PhysicalColumn)> {
        self.fields.iter().zip(self.columns.iter())
    }

    pub fn create_table_sql(&self) -> String {
        let mut columns = vec![format!(
            "{} BIGSERIAL PRIMARY KEY",
            quote_identifier(ROW_ID_COLUMN)
        )];
        columns.extend(self.columns.iter().map(PhysicalColumn::column_sql));
        format!(
            "CREATE TABLE {} ({})",
            quote_identifier(&self.table_name),
            columns.join(", ")
        )
    }
}

/// App-label namespace keeping dynamic tables apart from system tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNamespace {
    prefix: String,
}

impl TableNamespace {
    pub fn new(prefix: &str) -> Result<Self, DefinitionError> {
        let prefix = prefix.trim();
        let mut chars = prefix.chars();
        let valid_head = chars.next().is_some_and(|ch| ch.is_ascii_lowercase());
        let valid_tail =
            chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_');
        if !valid_head || !valid_tail || prefix.len() > PREFIX_MAX_CHARS {
            return Err(DefinitionError::InvalidPrefix(prefix.to_string()));
        }
        Ok(Self {
            prefix: prefix.to_string(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `<prefix>_<slug>_<hash>`; the hash covers owner and name so two owners
    /// never share a physical table.
    pub fn physical_table_name(&self, owner_id: &str, name: &str) -> String {
        let slug = name
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() {
                    ch.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .take(TABLE_SLUG_MAX_CHARS)
            .collect::<String>();
        let mut hasher = Sha256::new();
        hasher.update(owner_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!(
            "{}_{}_{}",
            self.prefix,
            slug,
            &digest[..TABLE_HASH_HEX_CHARS]
        )
    }

    pub fn contains(&self, table_name: &str) -> bool {
        table_name
            .strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.starts_with('_'))
    }
}

#[derive(Debug, Clone)]
pub struct DefinitionBuilder {
    namespace: TableNamespace,
}

impl DefinitionBuilder {
    pub fn new(namespace: TableNamespace) -> Self {
        Self { namespace }
    }

    pub fn namespace(&self) -> &TableNamespace {
        &self.namespace
    }

    /// Pure: never touches a store. Callers build once for the stored field
    /// list and once for the requested one, then hand both to the migrator.
    pub fn build(
        &self,
        owner_id: &str,
        name: &str,
        fields: &[FieldSpec],
    ) -> Result<TableDefinition, DefinitionError> {
        let columns = fields
            .iter()
            .map(|field| {
                let spec = registry::column_spec(field.field_type).map_err(|source| {
                    DefinitionError::InvalidFieldType {
                        title: field.title.clone(),
                        source,
                    }
                })?;
                Ok(PhysicalColumn {
                    name: physical_column_name(&field.title),
                    physical_type: spec.physical_type,
                    nullable: spec.nullable,
                })
            })
            .collect::<Result<Vec<_>, DefinitionError>>()?;

        Ok(TableDefinition {
            name: name.to_string(),
            table_name: self.namespace.physical_table_name(owner_id, name),
            fields: fields.to_vec(),
            columns,
        })
    }
}

pub fn physical_column_name(title: &str) -> String {
    if title.len() <= MAX_IDENTIFIER_BYTES {
        return title.to_string();
    }
    let digest = hex::encode(Sha256::digest(title.as_bytes()));
    format!("f_{}", &digest[..COLUMN_HASH_HEX_CHARS])
}

pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}
