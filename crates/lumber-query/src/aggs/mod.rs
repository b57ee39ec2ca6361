//! Recognition of the `aggs` subtree.
//!
//! Each aggregation node becomes at most one planned query with its own
//! response shaper. Bucket aggregations contribute a group-by level for the
//! subtree below them; pipeline aggregations reference a sibling query and
//! are computed in-process from its rows.

pub mod bucket;
pub mod metrics;
pub mod pipeline;

use serde_json::{Map, Value};
use tracing::warn;

use crate::ast::{self, column, count_star, function, infix, Expr, OrderByDirection, OrderByExpr, SelectCommand};
use crate::parser::QueryTranslator;
use crate::plan::{PlanKind, Query, SimpleQuery};

use bucket::{
    DateHistogramShaper, DateRangeShaper, DateTimeInterval, FiltersShaper, HistogramShaper,
    NumericRange, RangeShaper, TermsShaper,
};
use metrics::{MetricKind, MetricShaper, PercentilesShaper, StatsShaper, TopHitsShaper};
use pipeline::{PipelineKind, PipelineShaper};

type JsonObject = Map<String, Value>;

const DEFAULT_INTERVAL_MS: i64 = 30_000;
const DEFAULT_SAMPLER_ROWS: usize = 20_000;

/// Walks the aggregation subtree and returns the planned queries plus a flag
/// telling whether every node was recognized.
pub fn parse_aggregations(
    translator: &QueryTranslator<'_>,
    simple: &SimpleQuery,
    aggs: &Value,
    base_index: usize,
) -> (Vec<Query>, bool) {
    let Some(aggs_map) = aggs.as_object() else {
        warn!("aggs is not an object");
        return (Vec::new(), false);
    };
    let mut walker = AggWalker {
        translator,
        where_clause: simple.where_clause.clone(),
        base_index,
        queries: Vec::new(),
        ok: true,
    };
    let state = AggState::default();
    walker.walk(aggs_map, &state);
    (walker.queries, walker.ok)
}

#[derive(Clone, Default)]
struct AggState {
    path: Vec<String>,
    /// Key expressions of the enclosing bucket levels, outermost first.
    group_bys: Vec<Expr>,
    sample_limit: usize,
}

impl AggState {
    fn child(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.path.push(name.to_string());
        next
    }
}

struct AggWalker<'a, 'b> {
    translator: &'a QueryTranslator<'b>,
    where_clause: Option<Expr>,
    base_index: usize,
    queries: Vec<Query>,
    ok: bool,
}

impl AggWalker<'_, '_> {
    fn walk(&mut self, aggs: &JsonObject, state: &AggState) {
        for (name, node) in aggs {
            let Some(node) = node.as_object() else {
                warn!(name, "aggregation node is not an object");
                self.ok = false;
                continue;
            };
            self.walk_node(name, node, state);
        }
    }

    fn walk_node(&mut self, name: &str, node: &JsonObject, state: &AggState) {
        let child_aggs =
            node.get("aggs").or_else(|| node.get("aggregations")).and_then(Value::as_object);
        let state_here = state.child(name);

        if let Some(sampler) = node.get("sampler").or_else(|| node.get("random_sampler")) {
            let rows = sampler
                .get("shard_size")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_SAMPLER_ROWS);
            let mut sampled = state_here;
            sampled.sample_limit = rows;
            if let Some(children) = child_aggs {
                self.walk(children, &sampled);
            }
            return;
        }

        if let Some(terms) = node.get("terms").and_then(Value::as_object) {
            self.bucket_terms(name, terms, state, child_aggs);
            return;
        }
        if let Some(hist) = node.get("date_histogram").and_then(Value::as_object) {
            self.bucket_date_histogram(name, hist, state, child_aggs);
            return;
        }
        if let Some(hist) = node.get("histogram").and_then(Value::as_object) {
            self.bucket_histogram(name, hist, state, child_aggs);
            return;
        }
        if let Some(ranges) = node.get("date_range").and_then(Value::as_object) {
            self.bucket_date_range(name, ranges, state);
            return;
        }
        if let Some(ranges) = node.get("range").and_then(Value::as_object) {
            self.bucket_range(name, ranges, state);
            return;
        }
        if let Some(filters) = node.get("filters").and_then(Value::as_object) {
            self.bucket_filters(name, filters, state);
            return;
        }

        for (kind, key) in [
            (MetricKind::Avg, "avg"),
            (MetricKind::Sum, "sum"),
            (MetricKind::Min, "min"),
            (MetricKind::Max, "max"),
            (MetricKind::Cardinality, "cardinality"),
            (MetricKind::ValueCount, "value_count"),
        ] {
            if let Some(spec) = node.get(key).and_then(Value::as_object) {
                self.metric(name, kind, spec, state);
                return;
            }
        }
        if let Some(spec) = node.get("stats").and_then(Value::as_object) {
            self.stats(name, spec, state);
            return;
        }
        if let Some(spec) = node.get("percentiles").and_then(Value::as_object) {
            self.percentiles(name, spec, state);
            return;
        }
        if let Some(spec) = node.get("top_hits").and_then(Value::as_object) {
            self.top_hits(name, spec, state);
            return;
        }

        for (kind_key, make) in [
            ("derivative", PipelineKind::Derivative as fn(usize) -> PipelineKind),
            ("serial_diff", PipelineKind::SerialDiff),
            ("cumulative_sum", |_| PipelineKind::CumulativeSum),
            ("avg_bucket", |_| PipelineKind::AvgBucket),
            ("bucket_script", |_| PipelineKind::BucketScript),
        ] {
            if let Some(spec) = node.get(kind_key).and_then(Value::as_object) {
                let lag = spec.get("lag").and_then(Value::as_u64).unwrap_or(1) as usize;
                self.pipeline(name, make(lag), spec, state);
                return;
            }
        }

        warn!(name, keys = ?node.keys().collect::<Vec<_>>(), "unsupported aggregation type");
        self.ok = false;
    }

    // --- bucket aggregations ------------------------------------------------

    fn bucket_terms(
        &mut self,
        name: &str,
        terms: &JsonObject,
        state: &AggState,
        child_aggs: Option<&JsonObject>,
    ) {
        let Some(field) = self.field_of(terms) else {
            warn!(name, "terms aggregation without field");
            self.ok = false;
            return;
        };
        let size = terms.get("size").and_then(Value::as_u64).unwrap_or(10) as usize;
        let key = column(field);
        let state_here = state.child(name);

        let limit = if state.group_bys.is_empty() {
            size
        } else {
            // a LIMIT under an outer bucket would cap buckets globally, not
            // per group; leave it off
            0
        };
        let order = vec![OrderByExpr { exprs: vec![count_star()], direction: OrderByDirection::Desc }];
        self.push_bucket_query(&state_here, key.clone(), order, limit);

        if let Some(children) = child_aggs {
            let mut next = state_here;
            next.group_bys.push(key);
            self.walk(children, &next);
        }
    }

    fn bucket_date_histogram(
        &mut self,
        name: &str,
        hist: &JsonObject,
        state: &AggState,
        child_aggs: Option<&JsonObject>,
    ) {
        let Some(field) = self.field_of(hist) else {
            warn!(name, "date_histogram without field");
            self.ok = false;
            return;
        };
        let interval_ms = parse_interval_ms(&extract_interval(hist));
        let key = infix(
            function(
                "toInt64",
                vec![infix(
                    function("toUnixTimestamp64Milli", vec![column(field)]),
                    "/",
                    ast::literal(interval_ms.to_string()),
                )],
            ),
            "*",
            ast::literal(interval_ms.to_string()),
        );
        let state_here = state.child(name);
        let order = vec![OrderByExpr { exprs: vec![key.clone()], direction: OrderByDirection::Asc }];
        self.push_bucket_query_with_shaper(
            &state_here,
            key.clone(),
            order,
            0,
            Box::new(DateHistogramShaper { interval_ms }),
        );

        if let Some(children) = child_aggs {
            let mut next = state_here;
            next.group_bys.push(key);
            self.walk(children, &next);
        }
    }

    fn bucket_histogram(
        &mut self,
        name: &str,
        hist: &JsonObject,
        state: &AggState,
        child_aggs: Option<&JsonObject>,
    ) {
        let Some(field) = self.field_of(hist) else {
            warn!(name, "histogram without field");
            self.ok = false;
            return;
        };
        let interval = hist.get("interval").and_then(Value::as_f64).unwrap_or(1.0);
        let key = infix(
            function(
                "floor",
                vec![infix(column(field), "/", ast::literal(trim_float(interval)))],
            ),
            "*",
            ast::literal(trim_float(interval)),
        );
        let state_here = state.child(name);
        let order = vec![OrderByExpr { exprs: vec![key.clone()], direction: OrderByDirection::Asc }];
        self.push_bucket_query_with_shaper(
            &state_here,
            key.clone(),
            order,
            0,
            Box::new(HistogramShaper),
        );

        if let Some(children) = child_aggs {
            let mut next = state_here;
            next.group_bys.push(key);
            self.walk(children, &next);
        }
    }

    fn bucket_date_range(&mut self, name: &str, spec: &JsonObject, state: &AggState) {
        let Some(field) = self.field_of(spec) else {
            warn!(name, "date_range without field");
            self.ok = false;
            return;
        };
        let Some(ranges) = spec.get("ranges").and_then(Value::as_array) else {
            warn!(name, "date_range without ranges");
            self.ok = false;
            return;
        };

        let mut intervals = Vec::with_capacity(ranges.len());
        for range in ranges {
            let bound = |key: &str| -> String {
                match range.get(key).and_then(Value::as_str) {
                    None | Some("*") => DateTimeInterval::UNBOUNDED.to_string(),
                    Some(raw) => self.render_time_bound(raw, &field),
                }
            };
            intervals.push(DateTimeInterval { begin: bound("from"), end: bound("to") });
        }

        let mut columns: Vec<Expr> = state.group_bys.clone();
        for interval in &intervals {
            columns.push(interval.count_column(&field));
        }
        for interval in &intervals {
            if let Some(begin) = interval.begin_timestamp_column() {
                columns.push(begin);
            }
            if let Some(end) = interval.end_timestamp_column() {
                columns.push(end);
            }
        }

        let state_here = state.child(name);
        let select =
            self.select_with(columns, state.group_bys.clone(), vec![], 0, state_here.sample_limit);
        self.push_query(
            &state_here,
            select,
            Box::new(DateRangeShaper { intervals }),
            state.group_bys.len(),
        );
    }

    fn bucket_range(&mut self, name: &str, spec: &JsonObject, state: &AggState) {
        let Some(field) = self.field_of(spec) else {
            warn!(name, "range without field");
            self.ok = false;
            return;
        };
        let Some(ranges) = spec.get("ranges").and_then(Value::as_array) else {
            warn!(name, "range without ranges");
            self.ok = false;
            return;
        };

        let mut parsed = Vec::with_capacity(ranges.len());
        for range in ranges {
            parsed.push(NumericRange {
                from: range.get("from").and_then(Value::as_f64),
                to: range.get("to").and_then(Value::as_f64),
                key: range.get("key").and_then(Value::as_str).map(|s| s.to_string()),
            });
        }

        let mut columns: Vec<Expr> = state.group_bys.clone();
        for range in &parsed {
            columns.push(range.count_column(&field));
        }

        let state_here = state.child(name);
        let select = self.select_with(columns, state.group_bys.clone(), vec![], 0, state_here.sample_limit);
        self.push_query(
            &state_here,
            select,
            Box::new(RangeShaper { ranges: parsed }),
            state.group_bys.len(),
        );
    }

    fn bucket_filters(&mut self, name: &str, spec: &JsonObject, state: &AggState) {
        let Some(filters) = spec.get("filters").and_then(Value::as_object) else {
            warn!(name, "filters aggregation without inner filters");
            self.ok = false;
            return;
        };

        let mut names = Vec::with_capacity(filters.len());
        let mut columns: Vec<Expr> = state.group_bys.clone();
        // BTreeMap-backed serde maps iterate sorted, keeping column order
        // deterministic
        for (filter_name, filter_query) in filters {
            let Some(filter_map) = filter_query.as_object() else {
                warn!(filter = filter_name, "filter is not an object");
                self.ok = false;
                continue;
            };
            let parsed = self.translator.parse_query_map(filter_map);
            if !parsed.can_parse {
                self.ok = false;
                continue;
            }
            let cond = parsed.where_clause.unwrap_or_else(|| ast::literal("true"));
            columns.push(function(
                "count",
                vec![function(
                    "if",
                    vec![cond, ast::literal("1"), ast::literal("NULL")],
                )],
            ));
            names.push(filter_name.clone());
        }

        let state_here = state.child(name);
        let select = self.select_with(columns, state.group_bys.clone(), vec![], 0, state_here.sample_limit);
        self.push_query(
            &state_here,
            select,
            Box::new(FiltersShaper { names }),
            state.group_bys.len(),
        );
    }

    // --- metric aggregations ------------------------------------------------

    fn metric(&mut self, name: &str, kind: MetricKind, spec: &JsonObject, state: &AggState) {
        let Some(field) = self.field_of(spec) else {
            warn!(name, "metric aggregation without field");
            self.ok = false;
            return;
        };
        let value = kind.projection(&field);
        let state_here = state.child(name);
        let mut columns = state.group_bys.clone();
        columns.push(value);
        let order = key_order(&state.group_bys);
        let select =
            self.select_with(columns, state.group_bys.clone(), order, 0, state_here.sample_limit);
        self.push_query(&state_here, select, Box::new(MetricShaper { kind }), state.group_bys.len());
    }

    fn stats(&mut self, name: &str, spec: &JsonObject, state: &AggState) {
        let Some(field) = self.field_of(spec) else {
            warn!(name, "stats aggregation without field");
            self.ok = false;
            return;
        };
        let mut columns = state.group_bys.clone();
        columns.push(function("count", vec![column(field.clone())]));
        columns.push(function("minOrNull", vec![column(field.clone())]));
        columns.push(function("maxOrNull", vec![column(field.clone())]));
        columns.push(function("avgOrNull", vec![column(field.clone())]));
        columns.push(function("sumOrNull", vec![column(field)]));
        let state_here = state.child(name);
        let order = key_order(&state.group_bys);
        let select =
            self.select_with(columns, state.group_bys.clone(), order, 0, state_here.sample_limit);
        self.push_query(&state_here, select, Box::new(StatsShaper), state.group_bys.len());
    }

    fn percentiles(&mut self, name: &str, spec: &JsonObject, state: &AggState) {
        let Some(field) = self.field_of(spec) else {
            warn!(name, "percentiles aggregation without field");
            self.ok = false;
            return;
        };
        let percents: Vec<f64> = match spec.get("percents").and_then(Value::as_array) {
            Some(items) => items.iter().filter_map(Value::as_f64).collect(),
            None => vec![1.0, 5.0, 25.0, 50.0, 75.0, 95.0, 99.0],
        };
        let levels: Vec<String> =
            percents.iter().map(|p| trim_float(p / 100.0)).collect();
        let value = ast::multi_function(
            "quantiles",
            vec![ast::literal(levels.join(",")), column(field)],
        );
        let mut columns = state.group_bys.clone();
        columns.push(value);
        let state_here = state.child(name);
        let order = key_order(&state.group_bys);
        let select =
            self.select_with(columns, state.group_bys.clone(), order, 0, state_here.sample_limit);
        self.push_query(
            &state_here,
            select,
            Box::new(PercentilesShaper { percents }),
            state.group_bys.len(),
        );
    }

    fn top_hits(&mut self, name: &str, spec: &JsonObject, state: &AggState) {
        if !state.group_bys.is_empty() {
            warn!(name, "top_hits below a bucket aggregation is not supported");
            self.ok = false;
            return;
        }
        let size = spec.get("size").and_then(Value::as_u64).unwrap_or(3) as usize;
        let state_here = state.child(name);
        let select = self.select_with(vec![ast::wildcard()], vec![], vec![], size, state_here.sample_limit);
        self.push_query(&state_here, select, Box::new(TopHitsShaper { size }), 0);
    }

    // --- pipeline aggregations ----------------------------------------------

    fn pipeline(&mut self, name: &str, kind: PipelineKind, spec: &JsonObject, state: &AggState) {
        let buckets_path = spec.get("buckets_path").and_then(Value::as_str).unwrap_or("_count");
        let Some(parent_local) = self.find_parent_query(buckets_path, state) else {
            warn!(name, buckets_path, "pipeline aggregation without resolvable parent");
            self.ok = false;
            return;
        };
        let state_here = state.child(name);
        let select = self.queries[parent_local].select.clone();
        let shaper = PipelineShaper::new(kind, spec);
        let group_by_depth = self.queries[parent_local].group_by_depth;
        self.queries.push(Query {
            select,
            table_name: self.translator.index_context().table_name().to_string(),
            shaper: Box::new(shaper),
            plan_kind: PlanKind::Aggregation,
            agg_path: state_here.path,
            group_by_depth,
            pipeline_parent: Some(self.base_index + parent_local),
            highlighter: None,
        });
    }

    /// Resolves `buckets_path` to a previously planned query: the named
    /// sibling, or the enclosing bucket for `_count`.
    fn find_parent_query(&self, buckets_path: &str, state: &AggState) -> Option<usize> {
        let target = buckets_path.split('>').last().unwrap_or(buckets_path);
        if target == "_count" || target.is_empty() {
            // enclosing bucket query: the one planned for the current path
            return self
                .queries
                .iter()
                .rposition(|q| q.agg_path == state.path && q.shaper.is_bucket_aggregation());
        }
        self.queries.iter().rposition(|q| {
            q.agg_path.last().map(String::as_str) == Some(target)
                || q.agg_path == state.path
        })
    }

    // --- shared emission ----------------------------------------------------

    fn push_bucket_query(
        &mut self,
        state_here: &AggState,
        key: Expr,
        order: Vec<OrderByExpr>,
        limit: usize,
    ) {
        self.push_bucket_query_with_shaper(state_here, key, order, limit, Box::new(TermsShaper));
    }

    fn push_bucket_query_with_shaper(
        &mut self,
        state_here: &AggState,
        key: Expr,
        order: Vec<OrderByExpr>,
        limit: usize,
        shaper: Box<dyn crate::plan::ResponseShaper>,
    ) {
        let parent_keys = &state_here.group_bys;
        let mut columns = parent_keys.clone();
        columns.push(key.clone());
        columns.push(count_star());
        let mut group_by = parent_keys.clone();
        group_by.push(key);
        let mut order_by = key_order(parent_keys);
        order_by.extend(order);
        let select = self.select_with(columns, group_by, order_by, limit, state_here.sample_limit);
        self.push_query(state_here, select, shaper, parent_keys.len());
    }

    fn push_query(
        &mut self,
        state_here: &AggState,
        select: SelectCommand,
        shaper: Box<dyn crate::plan::ResponseShaper>,
        group_by_depth: usize,
    ) {
        self.queries.push(Query {
            select,
            table_name: self.translator.index_context().table_name().to_string(),
            shaper,
            plan_kind: PlanKind::Aggregation,
            agg_path: state_here.path.clone(),
            group_by_depth,
            pipeline_parent: None,
            highlighter: None,
        });
    }

    fn select_with(
        &self,
        columns: Vec<Expr>,
        group_by: Vec<Expr>,
        order_by: Vec<OrderByExpr>,
        limit: usize,
        sample_limit: usize,
    ) -> SelectCommand {
        let table = ast::table(self.translator.index_context().table_name());
        if sample_limit > 0 {
            // sampling wraps the scan in a row-limited subselect so the
            // group-by runs over at most that many rows
            let inner = SelectCommand::new(
                vec![ast::wildcard()],
                vec![],
                vec![],
                Some(table),
                self.where_clause.clone(),
                0,
                sample_limit,
                false,
            );
            SelectCommand::new(
                columns,
                group_by,
                order_by,
                Some(Expr::Select(Box::new(inner))),
                None,
                limit,
                0,
                false,
            )
        } else {
            SelectCommand::new(
                columns,
                group_by,
                order_by,
                Some(table),
                self.where_clause.clone(),
                limit,
                0,
                false,
            )
        }
    }

    fn field_of(&self, spec: &JsonObject) -> Option<String> {
        let raw = spec.get("field")?.as_str()?;
        Some(
            self.translator
                .index_context()
                .resolve_field(raw.trim_end_matches(".keyword")),
        )
    }

    fn render_time_bound(&self, raw: &str, field: &str) -> String {
        if let Some(expr) = crate::parser::datemath::parse(raw) {
            return self.translator.date_math_renderer().render(&expr);
        }
        let _ = field;
        format!("parseDateTime64BestEffort('{}')", raw)
    }
}

fn key_order(keys: &[Expr]) -> Vec<OrderByExpr> {
    keys.iter()
        .map(|k| OrderByExpr { exprs: vec![k.clone()], direction: OrderByDirection::Asc })
        .collect()
}

fn extract_interval(spec: &JsonObject) -> String {
    for key in ["fixed_interval", "calendar_interval", "interval"] {
        if let Some(Value::String(s)) = spec.get(key) {
            return s.clone();
        }
    }
    warn!("no interval found, using default");
    "30s".to_string()
}

fn parse_interval_ms(interval: &str) -> i64 {
    let digits: String = interval.chars().take_while(|c| c.is_ascii_digit()).collect();
    let unit = &interval[digits.len()..];
    let amount: i64 = digits.parse().unwrap_or(0);
    if amount == 0 {
        return DEFAULT_INTERVAL_MS;
    }
    let multiplier = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 604_800_000,
        // calendar months and years are approximated on fixed buckets
        "M" => 2_592_000_000,
        "y" => 31_536_000_000,
        _ => {
            warn!(interval, "unknown interval unit, using default");
            return DEFAULT_INTERVAL_MS;
        }
    };
    amount * multiplier
}

fn trim_float(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::StaticContext;
    use crate::parser::{DateMathRenderer, QueryTranslator};
    use crate::sql::select_to_sql;
    use serde_json::json;

    fn ctx() -> StaticContext {
        StaticContext::new("logs")
            .with_column("host", "String")
            .with_column("bytes", "Int64")
            .with_column("timestamp", "DateTime64(3)")
            .with_timestamp("timestamp")
    }

    fn plan(ctx: &StaticContext, aggs: serde_json::Value) -> Vec<Query> {
        let translator = QueryTranslator::new(ctx, DateMathRenderer::ClickhouseInterval);
        let simple = SimpleQuery::new(None, true);
        let (queries, ok) = parse_aggregations(&translator, &simple, &aggs, 0);
        assert!(ok, "aggs should be recognized: {}", aggs);
        queries
    }

    #[test]
    fn test_terms_aggregation_plan() {
        let queries = plan(
            &ctx(),
            json!({"hosts": {"terms": {"field": "host", "size": 5}}}),
        );
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].agg_path, vec!["hosts".to_string()]);
        assert_eq!(
            select_to_sql(&queries[0].select),
            r#"SELECT "host", count(*) FROM "logs" GROUP BY "host" ORDER BY count(*) desc LIMIT 5"#
        );
    }

    #[test]
    fn test_terms_with_nested_metric() {
        let queries = plan(
            &ctx(),
            json!({"hosts": {
                "terms": {"field": "host"},
                "aggs": {"total_bytes": {"sum": {"field": "bytes"}}}
            }}),
        );
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[1].agg_path, vec!["hosts".to_string(), "total_bytes".to_string()]);
        assert_eq!(queries[1].group_by_depth, 1);
        assert_eq!(
            select_to_sql(&queries[1].select),
            r#"SELECT "host", sumOrNull("bytes") FROM "logs" GROUP BY "host" ORDER BY "host" asc"#
        );
    }

    #[test]
    fn test_date_histogram_bucket_expression() {
        let queries = plan(
            &ctx(),
            json!({"over_time": {"date_histogram": {"field": "timestamp", "fixed_interval": "1h"}}}),
        );
        assert_eq!(
            select_to_sql(&queries[0].select),
            r#"SELECT toInt64(toUnixTimestamp64Milli("timestamp") / 3600000) * 3600000, count(*) FROM "logs" GROUP BY toInt64(toUnixTimestamp64Milli("timestamp") / 3600000) * 3600000 ORDER BY toInt64(toUnixTimestamp64Milli("timestamp") / 3600000) * 3600000 asc"#
        );
    }

    #[test]
    fn test_date_range_counts_intervals() {
        let queries = plan(
            &ctx(),
            json!({"recent": {"date_range": {"field": "timestamp", "ranges": [
                {"from": "now-1d/d", "to": "now"},
                {"from": "now"}
            ]}}}),
        );
        let sql = select_to_sql(&queries[0].select);
        assert!(sql.contains(
            r#"count(if(("timestamp" >= toStartOfDay(subDate(now(), INTERVAL 1 day)) AND "timestamp" < now()),1,NULL))"#
        ), "sql was: {}", sql);
        assert!(sql.contains(r#"count(if("timestamp" >= now(),1,NULL))"#));
        assert!(sql.contains("toInt64(toUnixTimestamp("));
    }

    #[test]
    fn test_filters_aggregation_one_column_per_filter() {
        let queries = plan(
            &ctx(),
            json!({"by_kind": {"filters": {"filters": {
                "errors": {"term": {"host": "err"}},
                "all": {"match_all": {}}
            }}}}),
        );
        let sql = select_to_sql(&queries[0].select);
        assert!(sql.contains(r#"count(if("host" = 'err',1,NULL))"#));
        assert!(sql.contains("count(if(true,1,NULL))"));
    }

    #[test]
    fn test_sampler_wraps_scan_in_limited_subselect() {
        let queries = plan(
            &ctx(),
            json!({"sample": {
                "sampler": {"shard_size": 500},
                "aggs": {"hosts": {"terms": {"field": "host", "size": 3}}}
            }}),
        );
        assert_eq!(queries.len(), 1);
        let sql = select_to_sql(&queries[0].select);
        assert!(sql.contains(r#"FROM (SELECT * FROM "logs" LIMIT 500)"#), "sql was: {}", sql);
        assert_eq!(queries[0].agg_path, vec!["sample".to_string(), "hosts".to_string()]);
    }

    #[test]
    fn test_percentiles_use_quantiles_multi_function() {
        let queries = plan(
            &ctx(),
            json!({"lat": {"percentiles": {"field": "bytes", "percents": [50, 99]}}}),
        );
        let sql = select_to_sql(&queries[0].select);
        assert!(sql.contains(r#"quantiles(0.5,0.99)("bytes")"#), "sql was: {}", sql);
    }

    #[test]
    fn test_pipeline_aggregation_references_parent() {
        let queries = plan(
            &ctx(),
            json!({"over_time": {
                "date_histogram": {"field": "timestamp", "fixed_interval": "1m"},
                "aggs": {"rate": {"derivative": {"buckets_path": "_count"}}}
            }}),
        );
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[1].pipeline_parent, Some(0));
        assert!(queries[1].no_db_query());
    }

    #[test]
    fn test_unknown_aggregation_flags_not_ok() {
        let translator_ctx = ctx();
        let translator =
            QueryTranslator::new(&translator_ctx, DateMathRenderer::ClickhouseInterval);
        let simple = SimpleQuery::new(None, true);
        let (queries, ok) = parse_aggregations(
            &translator,
            &simple,
            &json!({"geo": {"geohash_grid": {"field": "location"}}}),
            0,
        );
        assert!(!ok);
        assert!(queries.is_empty());
    }
}
