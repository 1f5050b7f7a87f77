use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

/// DDL for the metadata store. Idempotent.
pub const METADATA_SCHEMA_SQL: &str = include_str!("../schema/metadata.sql");

#[derive(Clone)]
pub struct TablesDb {
    client: Arc<Mutex<Client>>,
}

impl TablesDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "tables postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    pub async fn migrate(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(METADATA_SCHEMA_SQL)
            .await
            .context("apply schema metadata ddl")?;
        tracing::info!("schema metadata ddl applied");
        Ok(())
    }
}
