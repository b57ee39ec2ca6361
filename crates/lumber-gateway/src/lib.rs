//! Gateway runtime for Lumber.
//!
//! Wires the pure translation core from `lumber-query` to the outside world:
//! configuration, the schema registry over the live table catalog, the
//! database port, the query runner with its async lifecycle, and the
//! Elasticsearch-compatible HTTP surface.

pub mod api;
pub mod async_store;
pub mod config;
pub mod db;
pub mod handlers;
pub mod runner;
pub mod schema;
pub mod stats;
pub mod table;

pub use api::GatewayApi;
pub use config::GatewayConfig;
pub use db::DatabasePort;
pub use runner::QueryRunner;
pub use schema::SchemaRegistry;
pub use table::{Table, TableCatalog};
