//! HTTP API wiring: router, shared state and request metrics.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};
use tower_http::cors::CorsLayer;

use lumber_common::{Error, Result};

use crate::handlers::{
    bulk_stub, cluster_health, count_index, delete_async_search, doc_stub, get_async_search,
    index_bulk_stub, index_info, metrics_handler, resolve_index, root, search_async_index,
    search_index,
};
use crate::runner::QueryRunner;

/// Shared state behind every handler.
pub struct GatewayApi {
    pub runner: Arc<QueryRunner>,
    pub metrics: ApiMetrics,
}

/// Request metrics.
pub struct ApiMetrics {
    pub requests_total: CounterVec,
    pub request_duration_seconds: HistogramVec,
    pub errors_total: CounterVec,
}

impl ApiMetrics {
    fn new() -> Result<Self> {
        let requests_total = register_counter_vec!(
            "gateway_api_requests_total",
            "Total number of API requests",
            &["method", "endpoint", "status"]
        )
        .map_err(|e| Error::Internal(format!("failed to register metric: {}", e)))?;

        let request_duration_seconds = register_histogram_vec!(
            "gateway_api_request_duration_seconds",
            "API request duration in seconds",
            &["method", "endpoint"]
        )
        .map_err(|e| Error::Internal(format!("failed to register metric: {}", e)))?;

        let errors_total = register_counter_vec!(
            "gateway_api_errors_total",
            "Total number of API errors",
            &["method", "endpoint", "error_type"]
        )
        .map_err(|e| Error::Internal(format!("failed to register metric: {}", e)))?;

        Ok(Self { requests_total, request_duration_seconds, errors_total })
    }
}

impl GatewayApi {
    pub fn new(runner: Arc<QueryRunner>) -> Result<Self> {
        Ok(Self { runner, metrics: ApiMetrics::new()? })
    }

    /// The Elasticsearch-compatible surface. Paths are bit-exact for client
    /// compatibility.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(root))
            .route("/metrics", get(metrics_handler))
            .route("/:index/_search", get(search_index).post(search_index))
            .route("/:index/_async_search", post(search_async_index))
            .route(
                "/_async_search/:id",
                get(get_async_search).delete(delete_async_search),
            )
            .route("/:index/_count", get(count_index).post(count_index))
            // ingest endpoints are served by the ingest component; these
            // stubs keep clients from misrouting
            .route("/_bulk", post(bulk_stub))
            .route("/:index/_bulk", post(index_bulk_stub))
            .route("/:index/_doc", post(doc_stub))
            // compatibility stubs
            .route("/_cluster/health", get(cluster_health))
            .route("/_resolve/index/:pattern", get(resolve_index))
            .route("/:index", get(index_info))
            .layer(CorsLayer::permissive())
            .with_state(self)
    }
}
