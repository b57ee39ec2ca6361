//! Gateway server binary.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lumber_gateway::async_store::AsyncQueriesEvictor;
use lumber_gateway::config::GatewayConfig;
use lumber_gateway::db::DatabasePort;
use lumber_gateway::runner::{NoElasticsearch, QueryRunner};
use lumber_gateway::table::{Table, TableCatalog};
use lumber_gateway::GatewayApi;

use async_trait::async_trait;
use lumber_common::Result;
use lumber_query::QueryResultRow;

/// Stand-in port until a database client is wired in deployment; answers
/// every query with no rows so the gateway surface can be exercised.
struct NullDatabase;

#[async_trait]
impl DatabasePort for NullDatabase {
    async fn query_rows(
        &self,
        _sql: &str,
        _cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Vec<QueryResultRow>> {
        Ok(Vec::new())
    }

    async fn count(
        &self,
        _table: &str,
        _cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<i64> {
        Ok(0)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway_server=debug,lumber_gateway=debug,lumber_query=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LUMBER_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("lumber.yaml"));
    let addr = std::env::var("LUMBER_LISTEN").unwrap_or_else(|_| "0.0.0.0:9200".to_string());

    info!("starting lumber gateway");
    info!(config = %config_path.display(), "loading configuration");

    let config = match GatewayConfig::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("failed to load configuration: {}", e);
            return;
        }
    };

    // seed the catalog from configured static schemas; the live catalog is
    // refreshed by the ingest component's DDL in full deployments
    let catalog = Arc::new(TableCatalog::new());
    for (index_name, index_config) in config.enabled_indexes() {
        let mut table = Table::new(index_name);
        if let Some(static_schema) = &index_config.static_schema {
            for (field_name, field) in &static_schema.fields {
                if field.field_type == "alias" {
                    continue;
                }
                table.push_column(lumber_gateway::table::Column::new(
                    field_name,
                    column_type_for(&field.field_type),
                ));
            }
        }
        if let Some(ts) = &index_config.timestamp_field {
            table.push_column(lumber_gateway::table::Column::new(ts, "DateTime64(3)"));
            table.timestamp_column = Some(ts.clone());
        }
        table.full_text_columns = index_config.full_text_fields.clone();
        catalog.insert(table);
    }

    let runner = Arc::new(QueryRunner::new(
        config,
        catalog,
        Arc::new(NullDatabase),
        Arc::new(NoElasticsearch),
    ));

    let shutdown = CancellationToken::new();
    let evictor = AsyncQueriesEvictor::new(runner.async_store.clone());
    tokio::spawn(evictor.run(shutdown.clone()));

    let api = match GatewayApi::new(runner) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            error!("failed to create API: {}", e);
            return;
        }
    };
    let app = api.router().layer(TraceLayer::new_for_http());

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind to {}: {}", addr, e);
            return;
        }
    };

    info!(addr = %addr, "gateway ready to accept connections");
    info!("  Search:       POST /{{index}}/_search");
    info!("  Async search: POST /{{index}}/_async_search");
    info!("  Async poll:   GET  /_async_search/{{id}}");
    info!("  Count:        GET  /{{index}}/_count");

    if let Err(e) = axum::serve(listener, app).await {
        error!("server error: {}", e);
    }
    shutdown.cancel();
}

/// Reverse of the type adapter, for seeding catalog columns from declared
/// schema types.
fn column_type_for(field_type: &str) -> &'static str {
    match field_type {
        "keyword" | "text" => "String",
        "long" => "Int64",
        "unsigned_long" => "UInt64",
        "integer" => "Int32",
        "short" => "Int16",
        "byte" => "Int8",
        "float" => "Float32",
        "double" => "Float64",
        "boolean" => "Bool",
        "date" => "DateTime",
        "date_nanos" => "DateTime64(3)",
        "ip" => "IPv6",
        "geo_point" => "Point",
        _ => "String",
    }
}
