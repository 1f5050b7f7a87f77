use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    config::Config,
    tables::{
        TablesError, TablesService,
        types::{
            FieldErrors, RowCreatedResponse, SchemaMetadataRecord, TableMutationResponse,
            TableSchemaRequest,
        },
    },
};

pub const OWNER_HEADER: &str = "x-owner-id";
const OWNER_ID_MAX_CHARS: usize = 128;

#[derive(Clone)]
pub struct AppState {
    config: Config,
    tables: Arc<TablesService>,
    started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, tables: TablesService) -> Self {
        Self {
            config,
            tables: Arc::new(tables),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    uptime_seconds: i64,
    max_fields_per_table: usize,
    max_rows_per_table: u64,
    max_tables_per_owner: u64,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/tables", post(create_table))
        .route("/v1/tables/:name", get(get_table).put(update_table))
        .route("/v1/tables/:name/rows", get(list_rows).post(append_row))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    let policy = state.tables.policy();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name.clone(),
        uptime_seconds,
        max_fields_per_table: policy.max_fields_per_table,
        max_rows_per_table: policy.max_rows_per_table,
        max_tables_per_owner: policy.max_tables_per_owner,
    })
}

async fn create_table(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<TableSchemaRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TableMutationResponse>), ApiError> {
    let owner_id = owner_id(&headers)?;
    let Json(request) = payload.map_err(ApiError::from_json_rejection)?;
    let table = state
        .tables
        .define_table(&owner_id, &request)
        .await
        .map_err(ApiError::from_tables)?;
    Ok((
        StatusCode::CREATED,
        Json(TableMutationResponse {
            message: "Table created successfully.".to_string(),
            table,
        }),
    ))
}

async fn update_table(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<TableSchemaRequest>, JsonRejection>,
) -> Result<Json<TableMutationResponse>, ApiError> {
    let owner_id = owner_id(&headers)?;
    let Json(request) = payload.map_err(ApiError::from_json_rejection)?;
    let table = state
        .tables
        .replace_table(&owner_id, &name, &request)
        .await
        .map_err(ApiError::from_tables)?;
    Ok(Json(TableMutationResponse {
        message: "Table updated successfully.".to_string(),
        table,
    }))
}

async fn get_table(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SchemaMetadataRecord>, ApiError> {
    let owner_id = owner_id(&headers)?;
    let table = state
        .tables
        .describe_table(&owner_id, &name)
        .await
        .map_err(ApiError::from_tables)?;
    Ok(Json(table))
}

async fn list_rows(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Map<String, Value>>>, ApiError> {
    let owner_id = owner_id(&headers)?;
    let rows = state
        .tables
        .list_rows(&owner_id, &name)
        .await
        .map_err(ApiError::from_tables)?;
    Ok(Json(rows))
}

async fn append_row(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<RowCreatedResponse>), ApiError> {
    let owner_id = owner_id(&headers)?;
    let Json(payload) = payload.map_err(ApiError::from_json_rejection)?;
    let id = state
        .tables
        .append_row(&owner_id, &name, &payload)
        .await
        .map_err(ApiError::from_tables)?;
    Ok((
        StatusCode::CREATED,
        Json(RowCreatedResponse {
            message: "Row added successfully.".to_string(),
            id,
        }),
    ))
}

/// Identity is established upstream; this only checks the header is usable.
fn owner_id(headers: &HeaderMap) -> Result<String, ApiError> {
    let owner_id = headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {OWNER_HEADER} header")))?;
    if owner_id.chars().count() > OWNER_ID_MAX_CHARS {
        return Err(ApiError::Unauthorized(format!(
            "{OWNER_HEADER} exceeds {OWNER_ID_MAX_CHARS} characters"
        )));
    }
    Ok(owner_id.to_string())
}

#[derive(Debug)]
enum ApiError {
    Unauthorized(String),
    InvalidRequest(String),
    Validation(FieldErrors),
    PolicyRejected { code: &'static str, message: String },
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl ApiError {
    fn from_tables(error: TablesError) -> Self {
        match error {
            TablesError::Validation(errors) => Self::Validation(errors),
            TablesError::TooManyFields { .. }
            | TablesError::TooManyTables { .. }
            | TablesError::RowLimitExceeded { .. }
            | TablesError::FieldTypeChangeNotAllowed { .. } => Self::PolicyRejected {
                code: error.code(),
                message: error.message(),
            },
            TablesError::Conflict(message) => Self::Conflict(message),
            TablesError::NotFound(message) => Self::NotFound(message),
            TablesError::Store(message) => Self::Internal(message),
        }
    }

    fn from_json_rejection(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "unauthorized",
                    "message": message,
                })),
            )
                .into_response(),
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": "Invalid input.",
                    "errors": errors,
                })),
            )
                .into_response(),
            Self::PolicyRejected { code, message } => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": code,
                    "message": message,
                })),
            )
                .into_response(),
            Self::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "not_found",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Conflict(message) => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "conflict",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Internal(message) => {
                // Store detail stays in the logs.
                tracing::error!(reason = %message, "tables store failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "error": "internal",
                        "message": "internal error",
                    })),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests;
