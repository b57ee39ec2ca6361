//! Query translation core for Lumber.
//!
//! This crate is pure: it turns a search DSL request (JSON) into a list of
//! typed SQL SELECT commands plus per-query response shapers, and turns
//! result rows back into the response envelope. All I/O (schema discovery,
//! query execution, HTTP) lives in `lumber-gateway`.

pub mod aggs;
pub mod ast;
pub mod context;
pub mod highlight;
pub mod parser;
pub mod plan;
pub mod response;
pub mod sql;
pub mod transform;

pub use ast::{Expr, ExprVisitor, OrderByDirection, OrderByExpr, SelectCommand};
pub use context::{AttributePair, DateTimeKind, FieldKind, IndexContext};
pub use highlight::Highlighter;
pub use parser::QueryTranslator;
pub use plan::{
    PlanKind, Query, QueryResultRow, ResponseShaper, ResultCell, SearchQueryInfo,
    SearchQueryKind, SimpleQuery, TrackTotalHits,
};
pub use response::{make_search_response, AsyncSearchResponse, SearchResponse};
pub use transform::TransformPipeline;
