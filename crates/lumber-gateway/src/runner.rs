//! Query runner: pattern resolution, job fan-out, response assembly and the
//! sync/async request lifecycle.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lumber_common::{Error, Result};
use lumber_query::ast;
use lumber_query::parser::{DateMathRenderer, QueryTranslator};
use lumber_query::response::{
    empty_search_response, empty_search_response_bytes, make_search_response,
    search_to_async_response, SearchResponse,
};
use lumber_query::sql::select_to_sql;
use lumber_query::{PlanKind, Query, QueryResultRow, TransformPipeline};

use crate::async_store::{AsyncRequestResult, AsyncRequestStore, ASYNC_RESULT_TTL};
use crate::config::GatewayConfig;
use crate::db::DatabasePort;
use crate::schema::{IndexView, Schema, SchemaRegistry};
use crate::stats::{Statistics, UnsupportedQueryRegistry};
use crate::table::{is_index_pattern, pattern_matches, TableCatalog};

const MAX_PARALLEL_QUERIES: i64 = 25;
const ASYNC_ID_PREFIX: &str = "lumber_async_search_id_";

/// The Elasticsearch side of the deployment; patterns resolving there are
/// not ours to answer.
pub trait IndexInventory: Send + Sync {
    fn elasticsearch_indices(&self) -> Vec<String>;
}

/// Inventory for deployments without an Elasticsearch next door.
pub struct NoElasticsearch;

impl IndexInventory for NoElasticsearch {
    fn elasticsearch_indices(&self) -> Vec<String> {
        Vec::new()
    }
}

enum ResolvedSources {
    Both,
    None,
    Elasticsearch,
    Clickhouse(Vec<String>),
}

struct AsyncQuery {
    id: String,
    wait_for_ms: u64,
    keep_on_completion: bool,
    started_at: Instant,
}

pub struct QueryRunner {
    config: Arc<GatewayConfig>,
    catalog: Arc<TableCatalog>,
    registry: Arc<SchemaRegistry>,
    db: Arc<dyn DatabasePort>,
    inventory: Arc<dyn IndexInventory>,
    pub async_store: Arc<AsyncRequestStore>,
    pub statistics: Arc<Statistics>,
    pub unsupported: Arc<UnsupportedQueryRegistry>,
    execution_root: CancellationToken,
    async_request_id: AtomicI64,
    current_parallel_jobs: AtomicI64,
    date_math: DateMathRenderer,
}

impl QueryRunner {
    pub fn new(
        config: Arc<GatewayConfig>,
        catalog: Arc<TableCatalog>,
        db: Arc<dyn DatabasePort>,
        inventory: Arc<dyn IndexInventory>,
    ) -> Self {
        let registry = Arc::new(SchemaRegistry::new(config.clone(), catalog.clone()));
        let statistics = Arc::new(Statistics::new(config.ingest_statistics));
        Self {
            config,
            catalog,
            registry,
            db,
            inventory,
            async_store: Arc::new(AsyncRequestStore::new()),
            statistics,
            unsupported: Arc::new(UnsupportedQueryRegistry::new()),
            execution_root: CancellationToken::new(),
            async_request_id: AtomicI64::new(0),
            current_parallel_jobs: AtomicI64::new(0),
            date_math: DateMathRenderer::ClickhouseInterval,
        }
    }

    /// Stops every in-flight job.
    pub fn close(&self) {
        self.execution_root.cancel();
        info!("query runner stopped");
    }

    pub async fn search(self: &Arc<Self>, index_pattern: &str, body: &Value) -> Result<Vec<u8>> {
        self.search_common(index_pattern, body, None).await
    }

    pub async fn async_search(
        self: &Arc<Self>,
        index_pattern: &str,
        body: &Value,
        wait_for_ms: u64,
        keep_on_completion: bool,
    ) -> Result<Vec<u8>> {
        let id = format!(
            "{}{}",
            ASYNC_ID_PREFIX,
            self.async_request_id.fetch_add(1, Ordering::SeqCst) + 1
        );
        info!(id = %id, "async search request started");
        let async_query = AsyncQuery {
            id,
            wait_for_ms,
            keep_on_completion,
            started_at: Instant::now(),
        };
        self.search_common(index_pattern, body, Some(async_query)).await
    }

    /// Poll for an async result; the read consumes the stored entry.
    pub fn partial_async(&self, id: &str) -> Result<Vec<u8>> {
        if !id.starts_with(ASYNC_ID_PREFIX) {
            error!(id, "non-lumber async id");
            return self.async_envelope_bytes(id, false, 503);
        }
        match self.async_store.load(id) {
            Some(result) => {
                if let Some(err) = &result.error {
                    error!(id, error = %err, "async query failed");
                    return self.async_envelope_bytes(id, false, 503);
                }
                info!(id, "async query ended successfully");
                result.into_body()
            }
            None => {
                debug!(id, "async query partial result");
                let mut envelope =
                    search_to_async_response(empty_search_response(), id, true, 200, 0, 0);
                envelope.is_running = false;
                serde_json::to_vec(&envelope).map_err(Error::from)
            }
        }
    }

    pub fn delete_async(&self, id: &str) -> Result<Vec<u8>> {
        if !id.starts_with(ASYNC_ID_PREFIX) {
            return Err(Error::Unsupported(format!("invalid async search id: {}", id)));
        }
        self.async_store.delete(id);
        Ok(Vec::new())
    }

    /// Known tables, for the resolve/compat endpoints.
    pub fn table_names(&self) -> Vec<String> {
        self.catalog.table_names()
    }

    /// `{count}` over every table the pattern resolves to.
    pub async fn count(&self, index_pattern: &str) -> Result<i64> {
        let tables = self.catalog.resolve_pattern(index_pattern);
        if tables.is_empty() {
            if is_index_pattern(index_pattern) {
                return Ok(0);
            }
            warn!(pattern = index_pattern, "could not resolve table name");
            return Err(Error::IndexNotFound(index_pattern.to_string()));
        }
        let cancel = self.execution_root.child_token();
        let mut total = 0;
        for table in tables {
            total += self.db.count(&table, &cancel).await?;
        }
        Ok(total)
    }

    async fn search_common(
        self: &Arc<Self>,
        index_pattern: &str,
        body: &Value,
        opt_async: Option<AsyncQuery>,
    ) -> Result<Vec<u8>> {
        self.statistics.process(index_pattern, body);

        let resolved = self.resolve_sources(index_pattern);
        let mut sources = match resolved {
            ResolvedSources::Both => {
                return Err(Error::AmbiguousIndex(format!(
                    "index pattern [{}] resolved to both elasticsearch and clickhouse",
                    index_pattern
                )));
            }
            ResolvedSources::Elasticsearch => {
                return Err(Error::Unsupported(format!(
                    "index pattern [{}] resolved to elasticsearch indices",
                    index_pattern
                )));
            }
            ResolvedSources::None => {
                return self.empty_or_not_found(index_pattern, &opt_async);
            }
            ResolvedSources::Clickhouse(sources) => sources,
        };

        if is_index_pattern(index_pattern) {
            sources.retain(|s| self.catalog.contains(s));
        }
        if sources.is_empty() {
            return self.empty_or_not_found(index_pattern, &opt_async);
        }
        if sources.len() > 1 {
            warn!(
                pattern = index_pattern,
                "union of multiple tables is not supported yet, picking the first"
            );
            sources.truncate(1);
        }
        let table_name = sources.remove(0);

        let Some(table) = self.catalog.get(&table_name) else {
            return Err(Error::NoSuchTable(format!("can't load table {}", table_name)));
        };
        let schema = self.registry.find_schema(&table_name).unwrap_or_else(Schema::default);
        let view = IndexView { table: table.clone(), schema };

        let translator = QueryTranslator::new(&view, self.date_math.clone());
        let (queries, can_parse) = translator.parse_query(body);

        if !can_parse {
            self.unsupported.record(&unsupported_kind(body), body);
            error!(pattern = index_pattern, "invalid search query, can't parse");
            if is_index_pattern(index_pattern) {
                return self.empty_or_not_found(index_pattern, &opt_async);
            }
            return Err(Error::ParseRejected(format!(
                "query for [{}] was not recognized",
                index_pattern
            )));
        }

        let queries = TransformPipeline::new(&view).transform(queries);

        // list queries referencing schema fields that have no physical
        // column cannot produce rows
        let is_simple_list = !queries.is_empty()
            && queries.iter().all(|q| matches!(q.plan_kind, PlanKind::Hits | PlanKind::Count));
        if is_simple_list {
            let missing = self.nonexistent_properties(&queries, &view);
            if !missing.is_empty() {
                debug!(properties = ?missing, table = %table_name, "properties not found in table");
                if is_index_pattern(index_pattern) {
                    return self.empty_or_not_found(index_pattern, &opt_async);
                }
                return Err(Error::Unsupported(format!(
                    "properties {:?} not found in table {}",
                    missing, table_name
                )));
            }
        }

        match opt_async {
            None => {
                let started = Instant::now();
                let cancel = self.execution_root.child_token();
                let results = self.execute_plan(&queries, &cancel).await?;
                let took = started.elapsed().as_millis() as u64;
                let response = assemble_response(&queries, &results, took)?;
                serde_json::to_vec(&response).map_err(Error::from)
            }
            Some(async_query) => self.run_async(queries, async_query).await,
        }
    }

    async fn run_async(self: &Arc<Self>, queries: Vec<Query>, async_query: AsyncQuery) -> Result<Vec<u8>> {
        if self.async_store.capacity_reached() {
            error!(id = %async_query.id, "too many async queries");
            return Err(Error::AsyncCapacityExceeded("too many async queries".to_string()));
        }

        let id = async_query.id.clone();
        let cancel = self.execution_root.child_token();
        self.async_store.add_context(&id, cancel.clone());

        let started = async_query.started_at;
        let runner = Arc::clone(self);
        let (tx, mut rx) = oneshot::channel();
        let job_queries = queries;
        tokio::spawn(async move {
            let started_job = Instant::now();
            let outcome = match runner.execute_plan(&job_queries, &cancel).await {
                Ok(results) => {
                    let took = started_job.elapsed().as_millis() as u64;
                    assemble_response(&job_queries, &results, took)
                }
                Err(e) => Err(e),
            };
            let _ = tx.send(outcome);
        });

        let started_ms = chrono::Utc::now().timestamp_millis()
            - started.elapsed().as_millis() as i64;
        let expiration_ms = started_ms + ASYNC_RESULT_TTL.as_millis() as i64;

        tokio::select! {
            outcome = &mut rx => {
                self.async_store.drop_context(&id);
                match outcome {
                    Ok(Ok(response)) => {
                        let envelope = search_to_async_response(
                            response, &id, false, 200, started_ms, expiration_ms);
                        let body = serde_json::to_vec(&envelope)?;
                        self.async_store.store(
                            &id,
                            AsyncRequestResult::ok(body.clone()),
                            async_query.keep_on_completion,
                        );
                        Ok(body)
                    }
                    Ok(Err(e)) => {
                        if async_query.keep_on_completion {
                            self.async_store.store(&id, AsyncRequestResult::failed(e.to_string()), true);
                        }
                        Err(e)
                    }
                    Err(_) => Err(Error::Internal("async search worker vanished".to_string())),
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(async_query.wait_for_ms)) => {
                // the search outlived the wait; hand back a partial envelope
                // and let the worker finish into the store
                let store = self.async_store.clone();
                let late_id = id.clone();
                tokio::spawn(async move {
                    match rx.await {
                        Ok(Ok(response)) => {
                            let envelope = search_to_async_response(
                                response, &late_id, false, 200, started_ms, expiration_ms);
                            match serde_json::to_vec(&envelope) {
                                Ok(body) => store.store(&late_id, AsyncRequestResult::ok(body), true),
                                Err(e) => store.store(&late_id, AsyncRequestResult::failed(e.to_string()), true),
                            }
                        }
                        Ok(Err(e)) => {
                            store.store(&late_id, AsyncRequestResult::failed(e.to_string()), true);
                        }
                        Err(_) => {}
                    }
                    store.drop_context(&late_id);
                });
                let envelope = search_to_async_response(
                    empty_search_response(), &id, true, 200, started_ms, expiration_ms);
                serde_json::to_vec(&envelope).map_err(Error::from)
            }
        }
    }

    /// Dispatches the planned queries and returns rows positionally.
    async fn execute_plan(
        &self,
        queries: &[Query],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<QueryResultRow>>> {
        let mut results: Vec<Vec<QueryResultRow>> = vec![Vec::new(); queries.len()];

        let mut jobs: Vec<(usize, String)> = Vec::new();
        for (i, query) in queries.iter().enumerate() {
            if query.no_db_query() {
                debug!(shaper = %query.shaper, "pipeline query, no database round trip");
                continue;
            }
            if is_internal_kibana_query(query) {
                continue;
            }
            let sql = select_to_sql(&query.select);
            info!(sql = %sql, "SQL");
            jobs.push((i, sql));
        }

        for (index, rows) in self.run_query_jobs(jobs, cancel).await? {
            results[index] = queries[index].shaper.postprocess_rows(rows);
        }

        // pipeline aggregations post-process their parent's series
        for (i, query) in queries.iter().enumerate() {
            if let Some(parent) = query.pipeline_parent {
                if parent < results.len() {
                    results[i] = query.shaper.postprocess_rows(results[parent].clone());
                } else {
                    warn!(parent, "pipeline parent out of range");
                }
            }
        }

        Ok(results)
    }

    /// One job runs inline; several run in parallel unless that would push
    /// the process over the ceiling, in which case they run sequentially.
    async fn run_query_jobs(
        &self,
        jobs: Vec<(usize, String)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(usize, Vec<QueryResultRow>)>> {
        let job_count = jobs.len() as i64;
        if job_count <= 1 {
            return self.run_query_jobs_sequence(jobs, cancel).await;
        }

        let current = self.current_parallel_jobs.fetch_add(job_count, Ordering::SeqCst) + job_count;
        if current > MAX_PARALLEL_QUERIES {
            self.current_parallel_jobs.fetch_sub(job_count, Ordering::SeqCst);
            return self.run_query_jobs_sequence(jobs, cancel).await;
        }
        let result = self.run_query_jobs_parallel(jobs, cancel).await;
        self.current_parallel_jobs.fetch_sub(job_count, Ordering::SeqCst);
        result
    }

    async fn run_query_jobs_sequence(
        &self,
        jobs: Vec<(usize, String)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(usize, Vec<QueryResultRow>)>> {
        let mut out = Vec::with_capacity(jobs.len());
        for (index, sql) in jobs {
            let rows = self.db.query_rows(&sql, cancel).await?;
            out.push((index, rows));
        }
        Ok(out)
    }

    async fn run_query_jobs_parallel(
        &self,
        jobs: Vec<(usize, String)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(usize, Vec<QueryResultRow>)>> {
        // the first failing job cancels its siblings through this child token
        let job_cancel = cancel.child_token();
        let mut set = JoinSet::new();
        for (index, sql) in jobs {
            let db = self.db.clone();
            let token = job_cancel.clone();
            set.spawn(async move {
                let started = Instant::now();
                let rows = db.query_rows(&sql, &token).await;
                debug!(job = index, elapsed = ?started.elapsed(), "parallel job finished");
                (index, rows)
            });
        }

        let mut out = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(rows))) => out.push((index, rows)),
                Ok((index, Err(e))) => {
                    error!(job = index, error = %e, "query job failed, cancelling siblings");
                    job_cancel.cancel();
                    return Err(e);
                }
                Err(join_error) => {
                    job_cancel.cancel();
                    return Err(Error::Internal(format!("query job panicked: {}", join_error)));
                }
            }
        }
        out.sort_by_key(|(index, _)| *index);
        Ok(out)
    }

    fn resolve_sources(&self, index_pattern: &str) -> ResolvedSources {
        let elastic: Vec<String> = self
            .inventory
            .elasticsearch_indices()
            .into_iter()
            .filter(|name| pattern_matches(index_pattern, name))
            .collect();
        let mut clickhouse: Vec<String> = self
            .config
            .enabled_indexes()
            .map(|(name, _)| name.clone())
            .filter(|name| pattern_matches(index_pattern, name))
            .collect();
        clickhouse.sort();

        match (elastic.is_empty(), clickhouse.is_empty()) {
            (false, false) => ResolvedSources::Both,
            (true, true) => ResolvedSources::None,
            (false, true) => ResolvedSources::Elasticsearch,
            (true, false) => {
                debug!(pattern = index_pattern, tables = ?clickhouse, "pattern resolved to clickhouse tables");
                ResolvedSources::Clickhouse(clickhouse)
            }
        }
    }

    fn empty_or_not_found(
        &self,
        index_pattern: &str,
        opt_async: &Option<AsyncQuery>,
    ) -> Result<Vec<u8>> {
        if is_index_pattern(index_pattern) {
            return match opt_async {
                Some(async_query) => self.async_envelope_bytes(&async_query.id, false, 200),
                None => Ok(empty_search_response_bytes()),
            };
        }
        warn!(pattern = index_pattern, "could not resolve any table name");
        Err(Error::IndexNotFound(index_pattern.to_string()))
    }

    fn async_envelope_bytes(&self, id: &str, is_partial: bool, status: u16) -> Result<Vec<u8>> {
        let envelope =
            search_to_async_response(empty_search_response(), id, is_partial, status, 0, 0);
        serde_json::to_vec(&envelope).map_err(Error::from)
    }

    /// Schema fields referenced by the plan that have no physical column.
    fn nonexistent_properties(&self, queries: &[Query], view: &IndexView) -> Vec<String> {
        use lumber_query::context::IndexContext;

        let Some(query) = queries.iter().find(|q| q.plan_kind == PlanKind::Hits) else {
            return Vec::new();
        };
        let mut referenced: Vec<String> = Vec::new();
        for column_expr in &query.select.columns {
            for col in ast::used_columns(column_expr) {
                referenced.push(col.column_name);
            }
        }
        referenced.extend(query.select.order_by_field_names());

        referenced
            .into_iter()
            .map(|name| view.resolve_field(&name))
            .filter(|name| name != "*" && !view.table.has_column(name))
            .collect()
    }
}

/// Kibana's internal data_stream bookkeeping queries are answered with
/// nothing rather than forwarded.
fn is_internal_kibana_query(query: &Query) -> bool {
    query
        .select
        .columns
        .iter()
        .flat_map(ast::used_columns)
        .any(|col| col.column_name.starts_with("data_stream."))
}

fn unsupported_kind(body: &Value) -> String {
    body.get("query")
        .and_then(Value::as_object)
        .and_then(|m| m.keys().next())
        .cloned()
        .unwrap_or_else(|| "malformed".to_string())
}

/// Panics inside response assembly must not take the process down; they
/// surface as internal errors.
fn assemble_response(
    queries: &[Query],
    results: &[Vec<QueryResultRow>],
    took: u64,
) -> Result<SearchResponse> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        make_search_response(queries, results, took)
    }))
    .map_err(|_| Error::Internal("panic during response assembly".to_string()))
}
