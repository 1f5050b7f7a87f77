#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    config::Config,
    db::TablesDb,
    server::{AppState, build_router},
    tables::{TablesService, definition::DefinitionBuilder, physical, store},
};

pub mod config;
pub mod db;
pub mod server;
pub mod tables;

/// Postgres-backed stores when a database URL is configured, in-memory
/// otherwise.
pub async fn build_tables_state(config: Config) -> Result<AppState> {
    let (metadata, physical) = match config.db_url.as_deref() {
        Some(url) => {
            let db = Arc::new(TablesDb::connect(url).await?);
            db.migrate().await?;
            (store::postgres(db.clone()), physical::postgres(db))
        }
        None => {
            info!("no database url configured; using in-memory table stores");
            (store::memory(), physical::memory())
        }
    };
    let tables = TablesService::new_with_policy(
        metadata,
        physical,
        DefinitionBuilder::new(config.table_namespace.clone()),
        config.table_policy.clone(),
    );
    Ok(AppState::new(config, tables))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_tables_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        table_prefix = config.table_namespace.prefix(),
        "dynamic tables service listening"
    );
    axum::serve(listener, build_app(config).await?).await?;
    Ok(())
}
