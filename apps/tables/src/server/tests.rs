use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use super::{AppState, OWNER_HEADER, build_router};
use crate::{
    config::Config,
    tables::{
        TablesService,
        definition::DefinitionBuilder,
        physical::{self, PhysicalStore},
        store,
    },
};

fn test_config() -> Result<Config> {
    Ok(Config::from_lookup(|key| match key {
        "TABLES_SERVICE_NAME" => Some("tables-test".to_string()),
        _ => None,
    })?)
}

fn build_test_router() -> Result<axum::Router> {
    build_test_router_over(physical::memory())
}

fn build_test_router_over(physical: Arc<dyn PhysicalStore>) -> Result<axum::Router> {
    let config = test_config()?;
    let tables = TablesService::new(
        store::memory(),
        physical,
        DefinitionBuilder::new(config.table_namespace.clone()),
    );
    Ok(build_router(AppState::new(config, tables)))
}

fn json_request(
    method: Method,
    uri: &str,
    owner: Option<&str>,
    body: &Value,
) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(owner) = owner {
        builder = builder.header(OWNER_HEADER, owner);
    }
    Ok(builder.body(Body::from(serde_json::to_vec(body)?))?)
}

fn get_request(uri: &str, owner: &str) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(OWNER_HEADER, owner)
        .body(Body::empty())?)
}

async fn response_json(response: axum::response::Response) -> Result<Value> {
    let collected = response.into_body().collect().await?;
    let bytes = collected.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn people_schema() -> Value {
    json!({
        "name": "t1_",
        "fields": [
            {"type": "string", "title": "nm_"},
            {"type": "number", "title": "age"}
        ]
    })
}

#[tokio::test]
async fn health_reports_service_and_policy() -> Result<()> {
    let app = build_test_router()?;
    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "tables-test");
    assert_eq!(body["max_rows_per_table"], 10);
    Ok(())
}

#[tokio::test]
async fn create_then_duplicate_returns_conflict() -> Result<()> {
    let app = build_test_router()?;

    let response = app
        .clone()
        .oneshot(json_request(Method::POST, "/v1/tables", Some("alice"), &people_schema())?)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await?;
    assert_eq!(body["message"], "Table created successfully.");
    assert_eq!(body["table"]["table_name"], "t1_");
    assert_eq!(body["table"]["owner_id"], "alice");
    assert_eq!(
        body["table"]["fields"],
        json!([{"type": "string", "title": "nm_"}, {"type": "number", "title": "age"}])
    );

    let response = app
        .clone()
        .oneshot(json_request(Method::POST, "/v1/tables", Some("alice"), &people_schema())?)
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(response_json(response).await?["error"], "conflict");

    let response = app
        .oneshot(json_request(Method::POST, "/v1/tables", Some("bob"), &people_schema())?)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    Ok(())
}

#[tokio::test]
async fn missing_owner_header_is_unauthorized() -> Result<()> {
    let app = build_test_router()?;
    let response = app
        .oneshot(json_request(Method::POST, "/v1/tables", None, &people_schema())?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response_json(response).await?["error"], "unauthorized");
    Ok(())
}

#[tokio::test]
async fn invalid_schema_reports_field_errors() -> Result<()> {
    let app = build_test_router()?;
    let payload = json!({
        "name": "t1_",
        "fields": [
            {"type": "invalid", "title": "title"},
            {"type": "string", "title": "n1"}
        ]
    });
    let response = app
        .oneshot(json_request(Method::POST, "/v1/tables", Some("alice"), &payload)?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await?;
    assert_eq!(body["error"], "invalid_request");
    assert_eq!(
        body["errors"]["fields.0.type"],
        json!(["\"invalid\" is not a valid choice."])
    );
    assert_eq!(
        body["errors"]["fields.1.title"],
        json!(["Ensure this field has at least 3 characters."])
    );
    Ok(())
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() -> Result<()> {
    let app = build_test_router()?;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/tables")
        .header("content-type", "application/json")
        .header(OWNER_HEADER, "alice")
        .body(Body::from("{\"name\": "))?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json(response).await?["error"], "invalid_request");
    Ok(())
}

#[tokio::test]
async fn type_change_update_is_rejected() -> Result<()> {
    let app = build_test_router()?;
    app.clone()
        .oneshot(json_request(Method::POST, "/v1/tables", Some("alice"), &people_schema())?)
        .await?;

    let changed = json!({
        "name": "t1_",
        "fields": [
            {"type": "string", "title": "nm_"},
            {"type": "string", "title": "age"}
        ]
    });
    let response = app
        .clone()
        .oneshot(json_request(Method::PUT, "/v1/tables/t1_", Some("alice"), &changed)?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response_json(response).await?["error"],
        "field_type_change_not_allowed"
    );

    let response = app.oneshot(get_request("/v1/tables/t1_", "alice")?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response_json(response).await?["fields"],
        json!([{"type": "string", "title": "nm_"}, {"type": "number", "title": "age"}])
    );
    Ok(())
}

#[tokio::test]
async fn update_adds_field_and_rows_serialize_with_null() -> Result<()> {
    let app = build_test_router()?;
    app.clone()
        .oneshot(json_request(Method::POST, "/v1/tables", Some("alice"), &people_schema())?)
        .await?;
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/v1/tables/t1_/rows",
            Some("alice"),
            &json!({"nm_": "Alice", "age": 30, "ignored": true}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response_json(response).await?["id"], 1);

    let widened = json!({
        "name": "t1_",
        "fields": [
            {"type": "string", "title": "nm_"},
            {"type": "number", "title": "age"},
            {"type": "boolean", "title": "active"}
        ]
    });
    let response = app
        .clone()
        .oneshot(json_request(Method::PUT, "/v1/tables/t1_", Some("alice"), &widened)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response_json(response).await?["message"],
        "Table updated successfully."
    );

    let response = app
        .oneshot(get_request("/v1/tables/t1_/rows", "alice")?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response_json(response).await?,
        json!([{"nm_": "Alice", "age": 30, "active": null}])
    );
    Ok(())
}

#[tokio::test]
async fn row_limit_and_validation_errors_are_bad_requests() -> Result<()> {
    let app = build_test_router()?;
    app.clone()
        .oneshot(json_request(Method::POST, "/v1/tables", Some("alice"), &people_schema())?)
        .await?;

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/v1/tables/t1_/rows",
            Some("alice"),
            &json!({"nm_": "ab"}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await?;
    assert_eq!(
        body["errors"]["nm_"],
        json!(["Ensure this field has at least 3 characters."])
    );
    assert_eq!(body["errors"]["age"], json!(["This field is required."]));

    for index in 0..10 {
        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/v1/tables/t1_/rows",
                Some("alice"),
                &json!({"nm_": format!("row-{index}"), "age": index}),
            )?)
            .await?;
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    let response = app
        .oneshot(json_request(
            Method::POST,
            "/v1/tables/t1_/rows",
            Some("alice"),
            &json!({"nm_": "overflow", "age": 11}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await?;
    assert_eq!(body["error"], "row_limit_exceeded");
    assert_eq!(body["message"], "Exceeded max rows allowed (10).");
    Ok(())
}

#[tokio::test]
async fn unknown_tables_are_not_found_per_owner() -> Result<()> {
    let app = build_test_router()?;
    app.clone()
        .oneshot(json_request(Method::POST, "/v1/tables", Some("alice"), &people_schema())?)
        .await?;

    for uri in ["/v1/tables/t1_", "/v1/tables/t1_/rows"] {
        let response = app.clone().oneshot(get_request(uri, "bob")?).await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(response_json(response).await?["error"], "not_found");
    }
    Ok(())
}

#[tokio::test]
async fn missing_physical_table_hides_relation_name() -> Result<()> {
    let physical = physical::memory();
    let app = build_test_router_over(physical.clone())?;
    app.clone()
        .oneshot(json_request(Method::POST, "/v1/tables", Some("alice"), &people_schema())?)
        .await?;
    let config = test_config()?;
    let table_name = config
        .table_namespace
        .physical_table_name("alice", "t1_");
    physical.drop_table(&table_name).await?;

    let response = app
        .oneshot(json_request(
            Method::POST,
            "/v1/tables/t1_/rows",
            Some("alice"),
            &json!({"nm_": "Alice", "age": 30}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response_json(response).await?;
    assert_eq!(body["message"], "internal error");
    assert!(!body.to_string().contains(&table_name));
    Ok(())
}
