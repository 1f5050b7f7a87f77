use anyhow::{Context, Result};
use clap::Parser;
use dynamic_tables_service::config::database_url_from_lookup;
use dynamic_tables_service::db::{METADATA_SCHEMA_SQL, TablesDb};

/// Applies the schema metadata DDL to a Postgres database.
#[derive(Parser, Debug)]
#[command(name = "tables-migrate")]
struct Args {
    /// Falls back to DB_URL, then DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
    /// Print the DDL instead of applying it.
    #[arg(long)]
    print: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.print {
        print!("{METADATA_SCHEMA_SQL}");
        return Ok(());
    }

    let database_url = args
        .database_url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| database_url_from_lookup(&|key: &str| std::env::var(key).ok()))
        .context("--database-url, DB_URL or DATABASE_URL is required")?;

    let db = TablesDb::connect(&database_url).await?;
    db.migrate().await?;
    tracing::info!("tables metadata schema is up to date");
    Ok(())
}
