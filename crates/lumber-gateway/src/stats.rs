//! Request statistics and the unsupported-query registry.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

/// Statistics ingestion stops after this many requests per process.
pub const STATISTICS_LIMIT: i64 = 10_000;

/// At most this many raw payloads are kept per unsupported query type.
const UNSUPPORTED_SAMPLES_LIMIT: usize = 10;

#[derive(Default)]
pub struct IndexStatistics {
    pub requests: i64,
    /// key -> number of requests referencing it
    pub keys: HashMap<String, i64>,
}

/// Per-index counters over incoming request bodies, bounded to the first
/// [`STATISTICS_LIMIT`] requests.
#[derive(Default)]
pub struct Statistics {
    enabled: bool,
    inner: Mutex<HashMap<String, IndexStatistics>>,
}

impl Statistics {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, inner: Mutex::new(HashMap::new()) }
    }

    pub fn process(&self, index: &str, body: &Value) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        let stats = inner.entry(index.to_string()).or_default();
        if stats.requests >= STATISTICS_LIMIT {
            return;
        }
        stats.requests += 1;
        if let Value::Object(map) = body {
            for key in map.keys() {
                *stats.keys.entry(key.clone()).or_insert(0) += 1;
            }
        }
    }

    pub fn requests_for(&self, index: &str) -> i64 {
        self.inner.lock().get(index).map(|s| s.requests).unwrap_or(0)
    }

    pub fn key_count(&self, index: &str, key: &str) -> i64 {
        self.inner
            .lock()
            .get(index)
            .and_then(|s| s.keys.get(key).copied())
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct UnsupportedEntry {
    count: i64,
    samples: Vec<Value>,
}

/// Counts DSL shapes we refused, keeping a few sample payloads per type.
#[derive(Default)]
pub struct UnsupportedQueryRegistry {
    inner: Mutex<HashMap<String, UnsupportedEntry>>,
}

impl UnsupportedQueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, query_type: &str, payload: &Value) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(query_type.to_string()).or_default();
        entry.count += 1;
        if entry.samples.len() < UNSUPPORTED_SAMPLES_LIMIT {
            entry.samples.push(payload.clone());
        }
    }

    pub fn count(&self, query_type: &str) -> i64 {
        self.inner.lock().get(query_type).map(|e| e.count).unwrap_or(0)
    }

    pub fn samples(&self, query_type: &str) -> Vec<Value> {
        self.inner.lock().get(query_type).map(|e| e.samples.clone()).unwrap_or_default()
    }
}
