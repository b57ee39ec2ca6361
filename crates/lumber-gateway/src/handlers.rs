//! HTTP request handlers.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use lumber_common::Error;

use crate::api::GatewayApi;

/// Error envelope in the shape Elasticsearch clients expect.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
    pub status: u16,
}

#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub reason: String,
}

fn error_type_of(error: &Error) -> &'static str {
    match error {
        Error::ParseRejected(_) => "parsing_exception",
        Error::IndexNotFound(_) => "index_not_found_exception",
        Error::AmbiguousIndex(_) => "illegal_argument_exception",
        Error::NoSuchTable(_) => "index_not_found_exception",
        Error::Unsupported(_) => "unsupported_operation_exception",
        Error::AsyncCapacityExceeded(_) => "too_many_requests_exception",
        Error::Database(_) => "search_phase_execution_exception",
        _ => "internal_server_error_exception",
    }
}

fn error_response(error: Error) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorResponse {
        error: ErrorInfo {
            error_type: error_type_of(&error).to_string(),
            reason: error.to_string(),
        },
        status: status.as_u16(),
    };
    (status, Json(body)).into_response()
}

fn json_bytes(bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], bytes).into_response()
}

fn observe(api: &GatewayApi, method: &str, endpoint: &str, started: Instant, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    api.metrics.requests_total.with_label_values(&[method, endpoint, status]).inc();
    api.metrics
        .request_duration_seconds
        .with_label_values(&[method, endpoint])
        .observe(started.elapsed().as_secs_f64());
    if !ok {
        api.metrics.errors_total.with_label_values(&[method, endpoint, status]).inc();
    }
}

/// Prometheus exposition of the request counters.
pub async fn metrics_handler() -> Response {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return error_response(Error::Internal(format!("encoding metrics: {}", e)));
    }
    buffer.into_response()
}

/// Health / banner.
pub async fn root() -> Json<Value> {
    Json(json!({
        "name": "lumber",
        "version": { "number": env!("CARGO_PKG_VERSION") },
        "tagline": "search gateway for columnar log stores",
    }))
}

pub async fn search_index(
    Path(index): Path<String>,
    State(api): State<Arc<GatewayApi>>,
    body: Option<Json<Value>>,
) -> Response {
    let started = Instant::now();
    let body = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    match api.runner.search(&index, &body).await {
        Ok(bytes) => {
            observe(&api, "POST", "_search", started, true);
            json_bytes(bytes)
        }
        Err(e) => {
            observe(&api, "POST", "_search", started, false);
            error_response(e)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AsyncSearchParams {
    #[serde(default)]
    pub wait_for_completion_timeout: Option<String>,
    #[serde(default)]
    pub keep_on_completion: Option<bool>,
}

/// Default wait before an async search degrades to a partial response.
const DEFAULT_WAIT_FOR_COMPLETION_MS: u64 = 1000;

pub async fn search_async_index(
    Path(index): Path<String>,
    State(api): State<Arc<GatewayApi>>,
    Query(params): Query<AsyncSearchParams>,
    body: Option<Json<Value>>,
) -> Response {
    let started = Instant::now();
    let body = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    let wait_ms = params
        .wait_for_completion_timeout
        .as_deref()
        .and_then(parse_duration_ms)
        .unwrap_or(DEFAULT_WAIT_FOR_COMPLETION_MS);
    let keep = params.keep_on_completion.unwrap_or(false);
    match api.runner.async_search(&index, &body, wait_ms, keep).await {
        Ok(bytes) => {
            observe(&api, "POST", "_async_search", started, true);
            json_bytes(bytes)
        }
        Err(e) => {
            observe(&api, "POST", "_async_search", started, false);
            error_response(e)
        }
    }
}

pub async fn get_async_search(
    Path(id): Path<String>,
    State(api): State<Arc<GatewayApi>>,
) -> Response {
    match api.runner.partial_async(&id) {
        Ok(bytes) => json_bytes(bytes),
        Err(e) => error_response(e),
    }
}

pub async fn delete_async_search(
    Path(id): Path<String>,
    State(api): State<Arc<GatewayApi>>,
) -> Response {
    match api.runner.delete_async(&id) {
        Ok(_) => (StatusCode::OK, Json(json!({ "acknowledged": true }))).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn count_index(
    Path(index): Path<String>,
    State(api): State<Arc<GatewayApi>>,
) -> Response {
    match api.runner.count(&index).await {
        Ok(count) => Json(json!({
            "count": count,
            "_shards": { "total": 1, "successful": 1, "skipped": 0, "failed": 0 }
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// Ingest lives in its own component; the search gateway refuses the write
/// endpoints explicitly instead of 404ing.
pub async fn bulk_stub() -> Response {
    ingest_not_here()
}

pub async fn index_bulk_stub(Path(_index): Path<String>) -> Response {
    ingest_not_here()
}

pub async fn doc_stub(Path(_index): Path<String>) -> Response {
    ingest_not_here()
}

fn ingest_not_here() -> Response {
    error_response(Error::Unsupported(
        "ingest endpoints are not served by the search gateway".to_string(),
    ))
}

pub async fn cluster_health() -> Json<Value> {
    Json(json!({
        "cluster_name": "lumber",
        "status": "green",
        "timed_out": false,
        "number_of_nodes": 1,
        "number_of_data_nodes": 1,
        "active_primary_shards": 0,
        "active_shards": 0,
    }))
}

pub async fn resolve_index(
    Path(pattern): Path<String>,
    State(api): State<Arc<GatewayApi>>,
) -> Json<Value> {
    debug!(pattern = %pattern, "resolving index pattern");
    let indices: Vec<Value> = api
        .runner
        .table_names()
        .into_iter()
        .filter(|name| crate::table::pattern_matches(&pattern, name))
        .map(|name| json!({ "name": name, "attributes": ["open"] }))
        .collect();
    Json(json!({ "indices": indices, "aliases": [], "data_streams": [] }))
}

pub async fn index_info(
    Path(index): Path<String>,
    State(api): State<Arc<GatewayApi>>,
) -> Response {
    if api.runner.table_names().iter().any(|name| name == &index) {
        Json(json!({ &index: { "aliases": {}, "mappings": {}, "settings": {} } }))
            .into_response()
    } else {
        error_response(Error::IndexNotFound(index))
    }
}

/// `100ms`, `2s`, `1m` style timeouts.
fn parse_duration_ms(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
    let amount: u64 = digits.parse().ok()?;
    let unit = &raw[digits.len()..];
    match unit {
        "ms" => Some(amount),
        "s" | "" => Some(amount * 1000),
        "m" => Some(amount * 60 * 1000),
        _ => None,
    }
}
