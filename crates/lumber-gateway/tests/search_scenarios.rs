//! End-to-end search scenarios against mock database ports.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use lumber_common::{Error, Result};
use lumber_gateway::config::GatewayConfig;
use lumber_gateway::db::DatabasePort;
use lumber_gateway::runner::{NoElasticsearch, QueryRunner};
use lumber_gateway::table::{Table, TableCatalog};
use lumber_query::QueryResultRow;

/// Records statements and answers them from substring-keyed canned rows.
struct RecordingPort {
    responses: Mutex<Vec<(String, Vec<QueryResultRow>)>>,
    seen_sql: Mutex<Vec<String>>,
}

impl RecordingPort {
    fn new(responses: Vec<(&str, Vec<QueryResultRow>)>) -> Self {
        Self {
            responses: Mutex::new(
                responses.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            ),
            seen_sql: Mutex::new(Vec::new()),
        }
    }

    fn sql_containing(&self, needle: &str) -> Option<String> {
        self.seen_sql.lock().unwrap().iter().find(|sql| sql.contains(needle)).cloned()
    }
}

#[async_trait]
impl DatabasePort for RecordingPort {
    async fn query_rows(
        &self,
        sql: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<QueryResultRow>> {
        self.seen_sql.lock().unwrap().push(sql.to_string());
        let mut responses = self.responses.lock().unwrap();
        match responses.iter().position(|(key, _)| sql.contains(key.as_str())) {
            Some(i) => Ok(responses.remove(i).1),
            None => Ok(Vec::new()),
        }
    }

    async fn count(&self, _table: &str, _cancel: &CancellationToken) -> Result<i64> {
        Ok(0)
    }
}

/// Sleeps before answering; used for the async timeout scenario.
struct SlowPort {
    delay: Duration,
    rows: Vec<QueryResultRow>,
}

#[async_trait]
impl DatabasePort for SlowPort {
    async fn query_rows(
        &self,
        _sql: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueryResultRow>> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => Ok(self.rows.clone()),
            _ = cancel.cancelled() => Err(Error::Database("cancelled".to_string())),
        }
    }

    async fn count(&self, _table: &str, _cancel: &CancellationToken) -> Result<i64> {
        Ok(0)
    }
}

fn config() -> Arc<GatewayConfig> {
    Arc::new(
        GatewayConfig::from_yaml(
            r#"
indexes:
  logs:
    enabled: true
    timestampField: timestamp
    fullTextFields:
      - message
    static-schema:
      fields:
        client_ip:
          type: ip
"#,
        )
        .unwrap(),
    )
}

fn catalog() -> Arc<TableCatalog> {
    let catalog = TableCatalog::new();
    catalog.insert(
        Table::new("logs")
            .with_column("timestamp", "DateTime64(3)")
            .with_column("message", "String")
            .with_column("host.name", "String")
            .with_column("client_ip", "IPv4")
            .with_column("tags", "Array(String)")
            .with_timestamp("timestamp")
            .with_full_text(&["message"]),
    );
    Arc::new(catalog)
}

fn runner(db: Arc<dyn DatabasePort>) -> Arc<QueryRunner> {
    Arc::new(QueryRunner::new(config(), catalog(), db, Arc::new(NoElasticsearch)))
}

// S1 — range on a DateTime64 column renders best-effort parse calls.
#[tokio::test]
async fn scenario_range_on_datetime64_column() {
    let db = Arc::new(RecordingPort::new(vec![]));
    let r = runner(db.clone());
    let body = json!({"query": {"range": {"timestamp": {
        "gte": "2024-02-02T13:47:16.029Z",
        "lte": "2024-02-09T13:47:16.029Z",
        "format": "strict_date_optional_time"
    }}}});
    r.search("logs", &body).await.unwrap();

    let sql = db.sql_containing("SELECT *").expect("a hits query must run");
    assert!(
        sql.contains(
            r#""timestamp" >= parseDateTime64BestEffort('2024-02-02T13:47:16.029Z') AND "timestamp" <= parseDateTime64BestEffort('2024-02-09T13:47:16.029Z')"#
        ),
        "sql was: {}",
        sql
    );
}

// S2 — wildcard match becomes ILIKE with % substitution.
#[tokio::test]
async fn scenario_wildcard_match() {
    let db = Arc::new(RecordingPort::new(vec![]));
    let r = runner(db.clone());
    let body = json!({"query": {"wildcard": {"message": {"value": "foo*bar"}}}});
    r.search("logs", &body).await.unwrap();

    let sql = db.sql_containing("SELECT *").unwrap();
    assert!(sql.contains(r#""message" ILIKE 'foo%bar'"#), "sql was: {}", sql);
}

// S3 — a term over an ip-typed column with a CIDR literal is rewritten to
// a range containment call by the transform pipeline.
#[tokio::test]
async fn scenario_ip_range_rewrite() {
    let db = Arc::new(RecordingPort::new(vec![]));
    let r = runner(db.clone());
    let body = json!({"query": {"term": {"client_ip": "10.0.0.0/8"}}});
    r.search("logs", &body).await.unwrap();

    let sql = db.sql_containing("SELECT *").unwrap();
    assert!(
        sql.contains(r#"isIPAddressInRange(CAST("client_ip",'String'),'10.0.0.0/8')"#),
        "sql was: {}",
        sql
    );
}

// S4 — equality over Array(String) becomes has().
#[tokio::test]
async fn scenario_array_string_equality() {
    let db = Arc::new(RecordingPort::new(vec![]));
    let r = runner(db.clone());
    let body = json!({"query": {"term": {"tags": "prod"}}});
    r.search("logs", &body).await.unwrap();

    let sql = db.sql_containing("SELECT *").unwrap();
    assert!(sql.contains(r#"has("tags",'prod')"#), "sql was: {}", sql);
}

// S5 — the facets request shape is classified and runs a sampled group-by.
#[tokio::test]
async fn scenario_facets_request() {
    let db = Arc::new(RecordingPort::new(vec![(
        "GROUP BY",
        vec![
            QueryResultRow::new(vec![("key", json!("web-1")), ("doc_count", json!(7))]),
            QueryResultRow::new(vec![("key", json!("web-2")), ("doc_count", json!(3))]),
        ],
    )]));
    let r = runner(db.clone());
    let body = json!({
        "aggs": {"sample": {
            "sampler": {"shard_size": 5000},
            "aggs": {
                "sample_count": {"value_count": {"field": "host.name"}},
                "top_values": {"terms": {"field": "host.name", "size": 10}}
            }
        }},
        "size": 0,
        "track_total_hits": false
    });
    let bytes = r.search("logs", &body).await.unwrap();
    let response: Value = serde_json::from_slice(&bytes).unwrap();

    let sql = db.sql_containing("GROUP BY").unwrap();
    assert!(sql.contains(r#"LIMIT 5000"#), "sample limit missing: {}", sql);
    assert!(sql.contains(r#"LIMIT 10"#), "top-n limit missing: {}", sql);

    let sample = &response["aggregations"]["sample"];
    assert_eq!(sample["sample_count"]["value"], json!(10));
    let buckets = sample["top_values"]["buckets"].as_array().unwrap();
    assert_eq!(buckets[0]["key"], json!("web-1"));
    assert_eq!(buckets[0]["doc_count"], json!(7));
}

// S6 — async search against a deliberately slow database: partial envelope
// first, stored full result exactly once afterwards.
#[tokio::test(start_paused = true)]
async fn scenario_async_timeout_path() {
    let db = Arc::new(SlowPort {
        delay: Duration::from_millis(500),
        rows: vec![QueryResultRow::new(vec![
            ("timestamp", json!("2024-02-02T13:47:16.029Z")),
            ("message", json!("slow hit")),
        ])],
    });
    let r = runner(db);
    let body = json!({"query": {"match_all": {}}, "track_total_hits": false});

    let bytes = r.async_search("logs", &body, 1, true).await.unwrap();
    let partial: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(partial["is_partial"], json!(true));
    assert_eq!(partial["is_running"], json!(true));
    let id = partial["id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(600)).await;
    tokio::task::yield_now().await;

    let stored: Value = serde_json::from_slice(&r.partial_async(&id).unwrap()).unwrap();
    assert_eq!(stored["is_partial"], json!(false));
    assert_eq!(
        stored["response"]["hits"]["hits"][0]["_source"]["message"],
        json!("slow hit")
    );

    // one-shot read: the second poll no longer finds the payload
    let gone: Value = serde_json::from_slice(&r.partial_async(&id).unwrap()).unwrap();
    assert_eq!(gone["is_partial"], json!(true));
    assert_eq!(gone["is_running"], json!(false));
}

// Capacity: once the store holds the limit, further submissions fail.
#[tokio::test]
async fn scenario_async_capacity_guard() {
    use lumber_gateway::async_store::{AsyncRequestResult, ASYNC_QUERIES_LIMIT};

    let r = runner(Arc::new(RecordingPort::new(vec![])));
    for i in 0..ASYNC_QUERIES_LIMIT {
        r.async_store
            .store(&format!("lumber_async_search_id_x{}", i), AsyncRequestResult::ok(vec![1]), true);
    }
    let err = r
        .async_search("logs", &json!({"query": {"match_all": {}}}), 10, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AsyncCapacityExceeded(_)));
}

// Highlighting decorates matching string cells in hits.
#[tokio::test]
async fn scenario_highlighting() {
    let db = Arc::new(RecordingPort::new(vec![(
        "SELECT *",
        vec![QueryResultRow::new(vec![
            ("timestamp", json!("2024-02-02T13:47:16.029Z")),
            ("message", json!("connection refused by upstream")),
        ])],
    )]));
    let r = runner(db);
    let body = json!({
        "query": {"match": {"message": "refused"}},
        "track_total_hits": false,
        "highlight": {"pre_tags": ["<em>"], "post_tags": ["</em>"]}
    });
    let bytes = r.search("logs", &body).await.unwrap();
    let response: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(
        response["hits"]["hits"][0]["highlight"]["message"][0],
        json!("<em>refused</em>")
    );
}
