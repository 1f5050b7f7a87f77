use std::{
    env,
    net::{AddrParseError, SocketAddr},
};

use thiserror::Error;

use crate::tables::TablePolicyConfig;
use crate::tables::definition::TableNamespace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub db_url: Option<String>,
    pub table_namespace: TableNamespace,
    pub log_format: LogFormat,
    pub table_policy: TablePolicyConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TABLES_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid TABLES_PHYSICAL_TABLE_PREFIX: {0}")]
    InvalidPhysicalTablePrefix(String),
    #[error("invalid TABLES_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
    #[error("invalid table policy config: {0}")]
    InvalidTablePolicyConfig(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = lookup("TABLES_BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:4200".to_string())
            .parse()?;
        let service_name =
            lookup("TABLES_SERVICE_NAME").unwrap_or_else(|| "dynamic-tables".to_string());
        let db_url = database_url_from_lookup(&lookup);
        let prefix =
            lookup("TABLES_PHYSICAL_TABLE_PREFIX").unwrap_or_else(|| "dyntables".to_string());
        let table_namespace = TableNamespace::new(prefix.trim())
            .map_err(|error| ConfigError::InvalidPhysicalTablePrefix(error.to_string()))?;
        let log_format = parse_log_format(
            lookup("TABLES_LOG_FORMAT")
                .unwrap_or_else(|| "text".to_string())
                .as_str(),
        )?;
        let table_policy = parse_table_policy_from_env(&lookup)?;

        Ok(Self {
            service_name,
            bind_addr,
            db_url,
            table_namespace,
            log_format,
            table_policy,
        })
    }
}

/// `DB_URL`, then `DATABASE_URL`; blank values count as unset.
pub fn database_url_from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Option<String> {
    ["DB_URL", "DATABASE_URL"].into_iter().find_map(|key| non_blank(lookup(key)))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_table_policy_from_env(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<TablePolicyConfig, ConfigError> {
    let defaults = TablePolicyConfig::default();

    let max_fields_per_table = parse_u64_env_lookup(
        lookup,
        "TABLES_MAX_FIELDS_PER_TABLE",
        defaults.max_fields_per_table as u64,
        1,
        64,
    )? as usize;
    let max_rows_per_table = parse_u64_env_lookup(
        lookup,
        "TABLES_MAX_ROWS_PER_TABLE",
        defaults.max_rows_per_table,
        1,
        1_000_000,
    )?;
    let max_tables_per_owner = parse_u64_env_lookup(
        lookup,
        "TABLES_MAX_TABLES_PER_OWNER",
        defaults.max_tables_per_owner,
        1,
        10_000,
    )?;
    let row_page_size = parse_u64_env_lookup(
        lookup,
        "TABLES_ROW_PAGE_SIZE",
        defaults.row_page_size as u64,
        1,
        10_000,
    )? as usize;

    Ok(TablePolicyConfig {
        max_fields_per_table,
        max_rows_per_table,
        max_tables_per_owner,
        row_page_size,
    })
}

fn parse_u64_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        raw.trim()
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidTablePolicyConfig(format!("{key}: {error}")))
            .map(|value| value.clamp(min, max))
    })
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "text" | "pretty" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(ConfigError::InvalidLogFormat(other.to_string())),
    }
}
