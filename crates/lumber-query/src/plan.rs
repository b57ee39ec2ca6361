//! Planned queries, result rows and response shapers.
//!
//! The parser emits a list of [`Query`] values per request. Each carries a
//! SELECT command plus a [`ResponseShaper`] that knows how to turn the rows
//! coming back from the database into its fragment of the response envelope.

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::warn;

use crate::ast::SelectCommand;
use crate::highlight::Highlighter;

pub type JsonMap = serde_json::Map<String, Value>;

/// One cell of a result row.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultCell {
    pub name: String,
    pub value: Value,
}

/// One row returned by the database port.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResultRow {
    pub cells: Vec<ResultCell>,
}

impl QueryResultRow {
    pub fn new(cells: Vec<(&str, Value)>) -> Self {
        Self {
            cells: cells
                .into_iter()
                .map(|(name, value)| ResultCell { name: name.to_string(), value })
                .collect(),
        }
    }

    pub fn last_cell_value(&self) -> Option<&Value> {
        self.cells.last().map(|c| &c.value)
    }

    pub fn with_last_value(&self, value: Value) -> Self {
        let mut row = self.clone();
        if let Some(last) = row.cells.last_mut() {
            last.value = value;
        }
        row
    }
}

/// WHERE + ORDER BY extracted from the DSL, plus the parse-success flag.
/// `can_parse == false` is terminal: the runner must not execute the request.
#[derive(Debug, Clone, Default)]
pub struct SimpleQuery {
    pub where_clause: Option<crate::ast::Expr>,
    pub order_by: Vec<crate::ast::OrderByExpr>,
    pub can_parse: bool,
    pub field_name: Option<String>,
}

impl SimpleQuery {
    pub fn new(where_clause: Option<crate::ast::Expr>, can_parse: bool) -> Self {
        Self { where_clause, order_by: Vec::new(), can_parse, field_name: None }
    }

    pub fn with_field_name(
        where_clause: Option<crate::ast::Expr>,
        can_parse: bool,
        field_name: &str,
    ) -> Self {
        Self {
            where_clause,
            order_by: Vec::new(),
            can_parse,
            field_name: Some(field_name.to_string()),
        }
    }

    pub fn invalid() -> Self {
        Self::new(None, false)
    }
}

/// Sentinels for `track_total_hits`: `true` maps to the default 10000,
/// `false` to -1, an explicit integer is kept.
pub mod track_total_hits {
    pub const FALSE: i64 = -1;
    pub const DEFAULT: i64 = 10000;
}

pub type TrackTotalHits = i64;

/// Request classification derived from the metadata part of the body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SearchQueryKind {
    #[default]
    Normal,
    ListByField {
        field: String,
    },
    ListAllFields,
    Facets {
        field: String,
        /// terms size
        top_n: usize,
        /// sampler shard_size
        sample_limit: usize,
    },
    FacetsNumeric {
        field: String,
        top_n: usize,
        sample_limit: usize,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SearchQueryInfo {
    pub kind: SearchQueryKind,
    pub size: usize,
    pub track_total_hits: TrackTotalHits,
}

impl SearchQueryInfo {
    pub fn normal() -> Self {
        Self {
            kind: SearchQueryKind::Normal,
            size: DEFAULT_SIZE,
            track_total_hits: track_total_hits::DEFAULT,
        }
    }
}

pub const DEFAULT_SIZE: usize = 10;

/// Turns result rows into the JSON fragment this query contributes to the
/// response envelope.
pub trait ResponseShaper: fmt::Display + Send + Sync {
    fn is_bucket_aggregation(&self) -> bool;

    /// `level` is the number of group-by key columns preceding the value
    /// columns of this shaper.
    fn rows_to_json(&self, rows: &[QueryResultRow], level: usize) -> Vec<JsonMap>;

    fn postprocess_rows(&self, rows: Vec<QueryResultRow>) -> Vec<QueryResultRow> {
        rows
    }

    /// The complete response fragment for this query: bucket shapers wrap
    /// their bucket list, metric shapers return the value object directly.
    fn to_fragment(&self, rows: &[QueryResultRow], level: usize) -> Value {
        let items = self.rows_to_json(rows, level);
        if self.is_bucket_aggregation() {
            json!({ "buckets": items })
        } else {
            items.into_iter().next().map(Value::Object).unwrap_or_else(|| json!({}))
        }
    }
}

/// What role a planned query plays in the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Hits,
    Count,
    Facets,
    Aggregation,
}

/// One planned query.
pub struct Query {
    pub select: SelectCommand,
    pub table_name: String,
    pub shaper: Box<dyn ResponseShaper>,
    pub plan_kind: PlanKind,
    /// Path of aggregation names from the root of the `aggs` tree; empty for
    /// hits/count/facets queries.
    pub agg_path: Vec<String>,
    /// Number of group-by key columns preceding the value columns.
    pub group_by_depth: usize,
    /// Pipeline aggregations post-process the rows of a sibling query
    /// instead of hitting the database.
    pub pipeline_parent: Option<usize>,
    pub highlighter: Option<Highlighter>,
}

impl Query {
    pub fn no_db_query(&self) -> bool {
        self.pipeline_parent.is_some()
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("table_name", &self.table_name)
            .field("agg_path", &self.agg_path)
            .field("shaper", &self.shaper.to_string())
            .finish()
    }
}

/// Shaper for the hits part of the response.
pub struct HitsShaper {
    pub table_name: String,
    pub timestamp_column: Option<String>,
    pub highlighter: Highlighter,
    pub sort_field_names: Vec<String>,
    /// `(alias, target)` pairs fanned out into hit fields.
    pub aliases: Vec<(String, String)>,
    pub add_source: bool,
}

impl fmt::Display for HitsShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hits(table: {})", self.table_name)
    }
}

impl ResponseShaper for HitsShaper {
    fn is_bucket_aggregation(&self) -> bool {
        false
    }

    fn rows_to_json(&self, rows: &[QueryResultRow], _level: usize) -> Vec<JsonMap> {
        let hits: Vec<Value> = rows
            .iter()
            .enumerate()
            .map(|(i, row)| self.hit_to_json(row, i))
            .collect();
        let mut out = JsonMap::new();
        out.insert("hits".to_string(), Value::Array(hits));
        vec![out]
    }
}

impl HitsShaper {
    fn hit_to_json(&self, row: &QueryResultRow, row_index: usize) -> Value {
        let mut fields = JsonMap::new();
        let mut highlight = JsonMap::new();
        let mut source = JsonMap::new();

        for cell in &row.cells {
            if cell.value.is_null() {
                continue;
            }
            fields.insert(cell.name.clone(), json!([cell.value]));
            source.insert(cell.name.clone(), cell.value.clone());
            if self.highlighter.should_highlight(&cell.name) {
                if let Value::String(s) = &cell.value {
                    highlight.insert(
                        cell.name.clone(),
                        Value::Array(
                            self.highlighter
                                .highlight_value(&cell.name, s)
                                .into_iter()
                                .map(Value::String)
                                .collect(),
                        ),
                    );
                } else {
                    warn!(column = %cell.name, "non-string cell marked for highlighting");
                }
            }
        }

        for (alias, target) in &self.aliases {
            if let Some(v) = fields.get(target).cloned() {
                fields.insert(alias.clone(), v);
            }
        }

        let mut sort_values = Vec::new();
        for name in &self.sort_field_names {
            if let Some(Value::Array(vals)) = fields.get(name) {
                if let Some(first) = vals.first() {
                    sort_values.push(first.clone());
                }
            }
        }

        let mut hit = JsonMap::new();
        hit.insert("_index".to_string(), json!(self.table_name));
        hit.insert("_id".to_string(), json!(self.compute_id(row, row_index)));
        hit.insert("_score".to_string(), json!(1));
        hit.insert("_version".to_string(), json!(1));
        if self.add_source {
            hit.insert("_source".to_string(), Value::Object(source));
        }
        hit.insert("fields".to_string(), Value::Object(fields));
        if !sort_values.is_empty() {
            hit.insert("sort".to_string(), Value::Array(sort_values));
        }
        if !highlight.is_empty() {
            hit.insert("highlight".to_string(), Value::Object(highlight));
        }
        Value::Object(hit)
    }

    /// Derives a pseudo-unique document id from the timestamp cell: the
    /// hex-encoded timestamp text plus `q` plus the page-relative row number.
    /// Not stable across page sizes; callers must treat it as best-effort.
    fn compute_id(&self, row: &QueryResultRow, row_index: usize) -> String {
        let default_id = (row_index + 1).to_string();
        let Some(ts_column) = &self.timestamp_column else {
            return default_id;
        };
        let Some(cell) = row.cells.iter().find(|c| &c.name == ts_column) else {
            return default_id;
        };
        let Value::String(ts) = &cell.value else {
            return default_id;
        };
        let Ok(parsed) = ts.parse::<DateTime<Utc>>() else {
            return default_id;
        };
        let formatted = parsed.format("%Y-%m-%d %H:%M:%S%.3f +0000 UTC").to_string();
        let mut hexed = String::with_capacity(formatted.len() * 2);
        for b in formatted.as_bytes() {
            hexed.push_str(&format!("{:02x}", b));
        }
        format!("{}q{}", hexed, default_id)
    }
}

/// Shaper for the count query behind `track_total_hits`.
pub struct CountShaper;

impl fmt::Display for CountShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "count (non-aggregation)")
    }
}

impl ResponseShaper for CountShaper {
    fn is_bucket_aggregation(&self) -> bool {
        false
    }

    fn rows_to_json(&self, _rows: &[QueryResultRow], _level: usize) -> Vec<JsonMap> {
        Vec::new()
    }
}

/// Shaper for the facets query: buckets of `key` / `doc_count`, with
/// min/max attached for the numeric flavor.
pub struct FacetsShaper {
    pub numeric: bool,
}

impl fmt::Display for FacetsShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.numeric {
            write!(f, "facets_numeric")
        } else {
            write!(f, "facets")
        }
    }
}

impl ResponseShaper for FacetsShaper {
    fn is_bucket_aggregation(&self) -> bool {
        true
    }

    fn rows_to_json(&self, rows: &[QueryResultRow], _level: usize) -> Vec<JsonMap> {
        let mut buckets = Vec::new();
        let mut sample_count: i64 = 0;
        let mut min_value: Option<f64> = None;
        let mut max_value: Option<f64> = None;

        for row in rows {
            let key = row.cells.first().map(|c| c.value.clone()).unwrap_or(Value::Null);
            let doc_count = row.cells.get(1).map(|c| c.value.clone()).unwrap_or(json!(0));
            sample_count += doc_count.as_i64().unwrap_or(0);
            if self.numeric {
                if let Some(k) = key.as_f64() {
                    min_value = Some(min_value.map_or(k, |m| m.min(k)));
                    max_value = Some(max_value.map_or(k, |m| m.max(k)));
                }
            }
            let mut bucket = JsonMap::new();
            bucket.insert("key".to_string(), key);
            bucket.insert("doc_count".to_string(), doc_count);
            buckets.push(Value::Object(bucket));
        }

        let mut sample = JsonMap::new();
        sample.insert("doc_count".to_string(), json!(sample_count));
        sample.insert("sample_count".to_string(), json!({ "value": sample_count }));
        sample.insert("top_values".to_string(), json!({ "buckets": buckets }));
        if self.numeric {
            sample.insert("min_value".to_string(), json!({ "value": min_value }));
            sample.insert("max_value".to_string(), json!({ "value": max_value }));
        }

        let mut out = JsonMap::new();
        out.insert("sample".to_string(), Value::Object(sample));
        vec![out]
    }

    fn to_fragment(&self, rows: &[QueryResultRow], level: usize) -> Value {
        self.rows_to_json(rows, level)
            .into_iter()
            .next()
            .map(Value::Object)
            .unwrap_or_else(|| json!({}))
    }
}
