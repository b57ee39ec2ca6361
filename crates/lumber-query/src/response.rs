//! Response envelopes and assembly of per-query fragments.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::plan::{JsonMap, PlanKind, Query, QueryResultRow};

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub took: u64,
    pub timed_out: bool,
    #[serde(rename = "_shards")]
    pub shards: ShardInfo,
    pub hits: HitsEnvelope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardInfo {
    pub total: u32,
    pub successful: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl ShardInfo {
    pub fn single() -> Self {
        Self { total: 1, successful: 1, skipped: 0, failed: 0 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HitsEnvelope {
    pub total: Total,
    pub max_score: Option<f64>,
    pub hits: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Total {
    pub value: i64,
    pub relation: String,
}

/// Async wrapper around the search envelope.
#[derive(Debug, Clone, Serialize)]
pub struct AsyncSearchResponse {
    pub id: String,
    pub is_partial: bool,
    pub is_running: bool,
    pub start_time_in_millis: i64,
    pub expiration_time_in_millis: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time_in_millis: Option<i64>,
    pub response: SearchResponse,
    pub status: u16,
}

pub fn empty_search_response() -> SearchResponse {
    SearchResponse {
        took: 0,
        timed_out: false,
        shards: ShardInfo::single(),
        hits: HitsEnvelope {
            total: Total { value: 0, relation: "eq".to_string() },
            max_score: None,
            hits: Vec::new(),
        },
        aggregations: None,
    }
}

pub fn empty_search_response_bytes() -> Vec<u8> {
    serde_json::to_vec(&empty_search_response()).unwrap_or_default()
}

pub fn search_to_async_response(
    response: SearchResponse,
    id: &str,
    is_partial: bool,
    status: u16,
    started_at_ms: i64,
    expiration_ms: i64,
) -> AsyncSearchResponse {
    AsyncSearchResponse {
        id: id.to_string(),
        is_partial,
        is_running: is_partial,
        start_time_in_millis: started_at_ms,
        expiration_time_in_millis: expiration_ms,
        completion_time_in_millis: None,
        response,
        status,
    }
}

pub fn empty_async_search_response(
    id: &str,
    is_partial: bool,
    status: u16,
) -> AsyncSearchResponse {
    search_to_async_response(empty_search_response(), id, is_partial, status, 0, 0)
}

/// Assembles the final envelope out of per-query result rows.
///
/// The slices are positional: `results[i]` belongs to `queries[i]`.
pub fn make_search_response(
    queries: &[Query],
    results: &[Vec<QueryResultRow>],
    took_ms: u64,
) -> SearchResponse {
    let mut response = empty_search_response();
    response.took = took_ms;

    let mut aggregations = JsonMap::new();
    let mut total_from_count: Option<i64> = None;
    let mut hits_count = 0_i64;

    for (query, rows) in queries.iter().zip(results) {
        match query.plan_kind {
            PlanKind::Hits => {
                let fragments = query.shaper.rows_to_json(rows, 0);
                if let Some(Value::Array(hits)) =
                    fragments.first().and_then(|f| f.get("hits")).cloned()
                {
                    hits_count = hits.len() as i64;
                    response.hits.max_score = if hits.is_empty() { None } else { Some(1.0) };
                    response.hits.hits = hits;
                }
            }
            PlanKind::Count => {
                let value = rows
                    .first()
                    .and_then(|r| r.cells.first())
                    .and_then(|c| c.value.as_i64());
                match value {
                    Some(v) => total_from_count = Some(v),
                    None => warn!("count query returned no usable rows"),
                }
            }
            PlanKind::Facets => {
                if let Value::Object(fragment) = query.shaper.to_fragment(rows, 0) {
                    for (k, v) in fragment {
                        aggregations.insert(k, v);
                    }
                }
            }
            PlanKind::Aggregation => {}
        }
    }

    let agg_nodes: Vec<AggNode<'_>> = queries
        .iter()
        .zip(results)
        .filter(|(q, _)| q.plan_kind == PlanKind::Aggregation)
        .map(|(q, rows)| AggNode { query: q, rows })
        .collect();
    if !agg_nodes.is_empty() {
        let tree = build_subtree(&agg_nodes, &[], &[]);
        for (k, v) in tree {
            aggregations.insert(k, v);
        }
    }

    response.hits.total = Total {
        value: total_from_count.unwrap_or(hits_count),
        relation: "eq".to_string(),
    };
    if !aggregations.is_empty() {
        response.aggregations = Some(Value::Object(aggregations));
    }
    response
}

struct AggNode<'a> {
    query: &'a Query,
    rows: &'a Vec<QueryResultRow>,
}

/// Recursive assembly of the aggregation tree. `key_prefix` pins the bucket
/// keys of the enclosing levels; every node's rows are filtered by it.
fn build_subtree(nodes: &[AggNode<'_>], parent_path: &[String], key_prefix: &[Value]) -> JsonMap {
    let mut out = JsonMap::new();

    let mut segments: Vec<&String> = Vec::new();
    for node in nodes {
        if node.query.agg_path.len() > parent_path.len()
            && node.query.agg_path.starts_with(parent_path)
        {
            let segment = &node.query.agg_path[parent_path.len()];
            if !segments.contains(&segment) {
                segments.push(segment);
            }
        }
    }

    for segment in segments {
        let mut seg_path = parent_path.to_vec();
        seg_path.push(segment.clone());

        let own = nodes.iter().find(|n| n.query.agg_path == seg_path);
        let has_children = nodes
            .iter()
            .any(|n| n.query.agg_path.len() > seg_path.len() && n.query.agg_path.starts_with(&seg_path));

        match own {
            None => {
                // pure container level (e.g. a sampler): no query of its own
                let sub = build_subtree(nodes, &seg_path, key_prefix);
                out.insert(segment.clone(), Value::Object(sub));
            }
            Some(node) => {
                let level = node.query.group_by_depth;
                let filtered = filter_rows(node.rows, key_prefix);
                if node.query.shaper.is_bucket_aggregation() && has_children {
                    let mut buckets = node.query.shaper.rows_to_json(&filtered, level);
                    for (bucket, row) in buckets.iter_mut().zip(&filtered) {
                        let key_value = row
                            .cells
                            .get(level)
                            .map(|c| c.value.clone())
                            .unwrap_or(Value::Null);
                        let mut extended = key_prefix.to_vec();
                        extended.push(key_value);
                        let sub = build_subtree(nodes, &seg_path, &extended);
                        for (k, v) in sub {
                            bucket.insert(k, v);
                        }
                    }
                    out.insert(segment.clone(), json!({ "buckets": buckets }));
                } else {
                    out.insert(segment.clone(), node.query.shaper.to_fragment(&filtered, level));
                }
            }
        }
    }

    out
}

fn filter_rows(rows: &[QueryResultRow], key_prefix: &[Value]) -> Vec<QueryResultRow> {
    rows.iter()
        .filter(|row| {
            key_prefix
                .iter()
                .enumerate()
                .all(|(i, key)| row.cells.get(i).map(|c| &c.value) == Some(key))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::StaticContext;
    use crate::parser::{DateMathRenderer, QueryTranslator};

    fn ctx() -> StaticContext {
        StaticContext::new("logs")
            .with_column("host", "String")
            .with_column("bytes", "Int64")
            .with_column("timestamp", "DateTime64(3)")
            .with_timestamp("timestamp")
    }

    #[test]
    fn test_empty_response_shape() {
        let bytes = empty_search_response_bytes();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["hits"]["total"]["value"], json!(0));
        assert_eq!(parsed["_shards"]["successful"], json!(1));
        assert!(parsed.get("aggregations").is_none());
    }

    #[test]
    fn test_hits_and_count_assembly() {
        let ctx = ctx();
        let translator = QueryTranslator::new(&ctx, DateMathRenderer::ClickhouseInterval);
        let (queries, ok) = translator.parse_query(&serde_json::json!({
            "query": {"term": {"host": "a"}},
            "size": 2
        }));
        assert!(ok);
        // queries: [count, hits]
        let results = vec![
            vec![QueryResultRow::new(vec![("count()", json!(42))])],
            vec![
                QueryResultRow::new(vec![("host", json!("a")), ("message", json!("m1"))]),
                QueryResultRow::new(vec![("host", json!("a")), ("message", json!("m2"))]),
            ],
        ];
        let response = make_search_response(&queries, &results, 7);
        assert_eq!(response.took, 7);
        assert_eq!(response.hits.total.value, 42);
        assert_eq!(response.hits.hits.len(), 2);
        assert_eq!(response.hits.hits[0]["_index"], json!("logs"));
    }

    #[test]
    fn test_nested_aggregation_tree() {
        let ctx = ctx();
        let translator = QueryTranslator::new(&ctx, DateMathRenderer::ClickhouseInterval);
        let (queries, ok) = translator.parse_query(&serde_json::json!({
            "size": 0,
            "track_total_hits": false,
            "aggs": {"hosts": {
                "terms": {"field": "host", "size": 10},
                "aggs": {"total_bytes": {"sum": {"field": "bytes"}}}
            }}
        }));
        assert!(ok);
        // queries: [terms bucket, nested sum]
        let results = vec![
            vec![
                QueryResultRow::new(vec![("host", json!("a")), ("count()", json!(5))]),
                QueryResultRow::new(vec![("host", json!("b")), ("count()", json!(3))]),
            ],
            vec![
                QueryResultRow::new(vec![("host", json!("a")), ("sum", json!(100))]),
                QueryResultRow::new(vec![("host", json!("b")), ("sum", json!(60))]),
            ],
        ];
        let response = make_search_response(&queries, &results, 1);
        let aggs = response.aggregations.unwrap();
        let buckets = aggs["hosts"]["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0]["key"], json!("a"));
        assert_eq!(buckets[0]["doc_count"], json!(5));
        assert_eq!(buckets[0]["total_bytes"]["value"], json!(100));
        assert_eq!(buckets[1]["total_bytes"]["value"], json!(60));
    }

    #[test]
    fn test_sampler_container_level() {
        let ctx = ctx();
        let translator = QueryTranslator::new(&ctx, DateMathRenderer::ClickhouseInterval);
        let (queries, ok) = translator.parse_query(&serde_json::json!({
            "size": 0,
            "track_total_hits": false,
            "aggs": {"sample": {
                "sampler": {"shard_size": 100},
                "aggs": {"hosts": {"terms": {"field": "host", "size": 10}}}
            }}
        }));
        assert!(ok);
        let results = vec![vec![
            QueryResultRow::new(vec![("host", json!("a")), ("count()", json!(5))]),
        ]];
        let response = make_search_response(&queries, &results, 1);
        let aggs = response.aggregations.unwrap();
        let buckets = aggs["sample"]["hosts"]["buckets"].as_array().unwrap();
        assert_eq!(buckets[0]["key"], json!("a"));
    }
}
