//! Storage of async search results and their cancellation handles.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use lumber_common::{Error, Result};

pub const ASYNC_QUERIES_LIMIT: usize = 10_000;
pub const ASYNC_QUERIES_LIMIT_BYTES: usize = 1024 * 1024 * 500;
pub const ASYNC_RESULT_TTL: Duration = Duration::from_secs(15 * 60);

/// Payloads above this size get gzip-compressed before storage.
const COMPRESSION_THRESHOLD: usize = 4 * 1024;

/// A finished (or failed) async search waiting to be picked up.
pub struct AsyncRequestResult {
    body: Vec<u8>,
    is_compressed: bool,
    pub added: Instant,
    pub error: Option<String>,
}

impl AsyncRequestResult {
    pub fn ok(body: Vec<u8>) -> Self {
        let (body, is_compressed) = maybe_compress(body);
        Self { body, is_compressed, added: Instant::now(), error: None }
    }

    pub fn failed(error: String) -> Self {
        Self { body: Vec::new(), is_compressed: false, added: Instant::now(), error: Some(error) }
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    pub fn into_body(self) -> Result<Vec<u8>> {
        if self.is_compressed {
            let mut decoder = GzDecoder::new(self.body.as_slice());
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::Internal(format!("decompressing async result: {}", e)))?;
            Ok(out)
        } else {
            Ok(self.body)
        }
    }
}

fn maybe_compress(body: Vec<u8>) -> (Vec<u8>, bool) {
    if body.len() < COMPRESSION_THRESHOLD {
        return (body, false);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(&body).is_ok() {
        if let Ok(compressed) = encoder.finish() {
            if compressed.len() < body.len() {
                return (compressed, true);
            }
        }
    }
    (body, false)
}

/// The execution context of one in-flight async search.
pub struct AsyncQueryContext {
    pub id: String,
    pub cancel: CancellationToken,
    pub added: Instant,
}

/// Keyed registry of async results plus the contexts of still-running
/// queries. Reads are one-shot: `load` removes the entry it returns.
#[derive(Default)]
pub struct AsyncRequestStore {
    results: DashMap<String, AsyncRequestResult>,
    contexts: DashMap<String, AsyncQueryContext>,
}

impl AsyncRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `keep == false` requests are dropped on the floor; the submitter
    /// already got the payload synchronously.
    pub fn store(&self, id: &str, result: AsyncRequestResult, keep: bool) {
        if !keep {
            return;
        }
        self.results.insert(id.to_string(), result);
    }

    /// Atomic read-and-delete: two concurrent loads see the entry at most
    /// once.
    pub fn load(&self, id: &str) -> Option<AsyncRequestResult> {
        self.results.remove(id).map(|(_, v)| v)
    }

    pub fn delete(&self, id: &str) {
        self.results.remove(id);
        if let Some((_, ctx)) = self.contexts.remove(id) {
            ctx.cancel.cancel();
        }
    }

    pub fn add_context(&self, id: &str, cancel: CancellationToken) {
        self.contexts.insert(
            id.to_string(),
            AsyncQueryContext { id: id.to_string(), cancel, added: Instant::now() },
        );
    }

    pub fn drop_context(&self, id: &str) {
        self.contexts.remove(id);
    }

    pub fn pending_count(&self) -> usize {
        self.results.len()
    }

    /// Total bytes currently held; the capacity guard caps this.
    pub fn stored_bytes(&self) -> usize {
        self.results.iter().map(|entry| entry.value().body_len()).sum()
    }

    pub fn capacity_reached(&self) -> bool {
        self.pending_count() >= ASYNC_QUERIES_LIMIT
            || self.stored_bytes() >= ASYNC_QUERIES_LIMIT_BYTES
    }

    /// Drops entries older than the TTL, cancelling their contexts.
    pub fn evict(&self, ttl: Duration) {
        let mut evicted = 0;
        self.results.retain(|_, result| {
            let keep = result.added.elapsed() < ttl;
            if !keep {
                evicted += 1;
            }
            keep
        });
        self.contexts.retain(|_, ctx| {
            let keep = ctx.added.elapsed() < ttl;
            if !keep {
                debug!(id = %ctx.id, "cancelling evicted async query context");
                ctx.cancel.cancel();
            }
            keep
        });
        if evicted > 0 {
            info!(evicted, "evicted stale async search results");
        }
    }
}

/// Periodic eviction of stale async entries.
pub struct AsyncQueriesEvictor {
    store: Arc<AsyncRequestStore>,
    ttl: Duration,
}

impl AsyncQueriesEvictor {
    pub fn new(store: Arc<AsyncRequestStore>) -> Self {
        Self { store, ttl: ASYNC_RESULT_TTL }
    }

    /// Runs until the token is cancelled; call from a spawned task.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.store.evict(self.ttl),
                _ = shutdown.cancelled() => {
                    info!("async queries evictor stopped");
                    return;
                }
            }
        }
    }
}
