use std::sync::Arc;

use crate::tables::definition::TableDefinition;
use crate::tables::physical::{PhysicalStore, PhysicalStoreError};

/// Answers "does this table already exist physically" from the store's own
/// catalog, never from the metadata record.
#[derive(Clone)]
pub struct TableExistenceResolver {
    physical: Arc<dyn PhysicalStore>,
}

impl TableExistenceResolver {
    pub fn new(physical: Arc<dyn PhysicalStore>) -> Self {
        Self { physical }
    }

    pub async fn exists(&self, definition: &TableDefinition) -> Result<bool, PhysicalStoreError> {
        self.physical.table_exists(definition.table_name()).await
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::TableExistenceResolver;
    use crate::tables::definition::{DefinitionBuilder, TableNamespace};
    use crate::tables::physical;
    use crate::tables::types::{FieldSpec, FieldType};

    #[tokio::test]
    async fn every_valid_field_list_exists_after_creation() -> Result<()> {
        let store = physical::memory();
        let resolver = TableExistenceResolver::new(store.clone());
        let builder = DefinitionBuilder::new(TableNamespace::new("dyntables")?);
        let types = [FieldType::String, FieldType::Number, FieldType::Boolean];

        for count in 1..=10 {
            let fields = (0..count)
                .map(|index| FieldSpec::new(types[index % types.len()], format!("col_{index}")))
                .collect::<Vec<_>>();
            let definition = builder.build("owner", &format!("table_{count}"), &fields)?;
            assert!(!resolver.exists(&definition).await?);
            store.create_table(&definition).await?;
            assert!(resolver.exists(&definition).await?);
        }
        Ok(())
    }

    #[tokio::test]
    async fn another_owners_table_is_not_visible() -> Result<()> {
        let store = physical::memory();
        let resolver = TableExistenceResolver::new(store.clone());
        let builder = DefinitionBuilder::new(TableNamespace::new("dyntables")?);
        let fields = [FieldSpec::new(FieldType::String, "nm_")];

        store
            .create_table(&builder.build("alice", "shared", &fields)?)
            .await?;
        assert!(
            !resolver
                .exists(&builder.build("bob", "shared", &fields)?)
                .await?
        );
        Ok(())
    }
}
