//! Recursive descent over the search DSL into SQL SELECT commands.
//!
//! Construction is purely syntactic: the translator never executes SQL.
//! Parsing is total — malformed input flips `can_parse` to false instead of
//! returning errors, and the runner refuses to execute such a plan.

pub mod datemath;
pub mod lucene;

use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::ast::{
    self, aliased, and, column, count_star, function, infix, nested_property, or, paren, prefix,
    quoted_literal, sort_column, table, wildcard, Expr, OrderByDirection, OrderByExpr,
    SelectCommand,
};
use crate::context::{DateTimeKind, FieldKind, IndexContext};
use crate::highlight::Highlighter;
use crate::plan::{
    track_total_hits, CountShaper, FacetsShaper, HitsShaper, PlanKind, Query, SearchQueryInfo,
    SearchQueryKind, SimpleQuery, DEFAULT_SIZE,
};

pub use datemath::DateMathRenderer;

type JsonObject = Map<String, Value>;

pub struct QueryTranslator<'a> {
    ctx: &'a dyn IndexContext,
    date_math: DateMathRenderer,
}

impl<'a> QueryTranslator<'a> {
    pub fn new(ctx: &'a dyn IndexContext, date_math: DateMathRenderer) -> Self {
        Self { ctx, date_math }
    }

    /// Parses a request body into the list of planned queries.
    ///
    /// Returns `(queries, can_parse)`; when `can_parse` is false the queries
    /// list is empty and the runner must report a parse error.
    pub fn parse_query(&self, body: &Value) -> (Vec<Query>, bool) {
        let (simple, info, highlighter) = self.parse_query_internal(body);
        if !simple.can_parse {
            return (Vec::new(), false);
        }

        let mut queries = Vec::new();

        if let Some(count) = self.build_count_query_if_needed(&simple, &info) {
            queries.push(count);
        }

        if let Some(facets) = self.build_facets_query_if_needed(&simple, &info) {
            queries.push(facets);
        } else if let Some(aggs) = body.get("aggs").or_else(|| body.get("aggregations")) {
            let base = queries.len();
            let (mut agg_queries, ok) = crate::aggs::parse_aggregations(self, &simple, aggs, base);
            if !ok {
                warn!(table = %self.ctx.table_name(), "aggregation subtree not fully recognized");
            }
            queries.append(&mut agg_queries);
        }

        if let Some(hits) = self.build_list_query_if_needed(&simple, &info, &highlighter) {
            queries.push(hits);
        }

        (queries, true)
    }

    /// The syntactic front half: WHERE + ORDER BY, classification, highlighter.
    pub fn parse_query_internal(
        &self,
        body: &Value,
    ) -> (SimpleQuery, SearchQueryInfo, Highlighter) {
        let Some(body_map) = body.as_object() else {
            warn!("request body is not a JSON object");
            return (SimpleQuery::invalid(), SearchQueryInfo::normal(), Highlighter::disabled());
        };

        let highlighter = self.parse_highlighter(body_map);

        let mut simple = match body_map.get("query") {
            Some(Value::Object(query_map)) => self.parse_query_map(query_map),
            Some(other) => {
                warn!(value = %other, "invalid query type");
                SimpleQuery::invalid()
            }
            None => SimpleQuery::new(None, true),
        };

        if let Some(sort) = body_map.get("sort") {
            simple.order_by = self.parse_sort_fields(sort);
        }

        let size = match body_map.get("size") {
            None => DEFAULT_SIZE,
            Some(Value::Number(n)) => n.as_u64().unwrap_or(DEFAULT_SIZE as u64) as usize,
            Some(other) => {
                warn!(value = %other, "unknown size format, using default");
                DEFAULT_SIZE
            }
        };

        let tth = match body_map.get("track_total_hits") {
            None => track_total_hits::DEFAULT,
            Some(Value::Bool(true)) => track_total_hits::DEFAULT,
            Some(Value::Bool(false)) => track_total_hits::FALSE,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(track_total_hits::DEFAULT),
            Some(other) => {
                warn!(value = %other, "unknown track_total_hits format, using default");
                track_total_hits::DEFAULT
            }
        };

        let metadata = self.parse_metadata(body_map);
        let mut info = self.try_process_search_metadata(&metadata);
        info.size = size;
        info.track_total_hits = tth;

        (simple, info, highlighter)
    }

    fn parse_highlighter(&self, body: &JsonObject) -> Highlighter {
        let Some(Value::Object(highlight)) = body.get("highlight") else {
            return Highlighter::disabled();
        };
        let tags = |key: &str| -> Vec<String> {
            match highlight.get(key) {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|t| match t {
                        Value::String(s) => Some(s.clone()),
                        other => {
                            warn!(value = %other, key, "unknown highlight tag format, skipping");
                            None
                        }
                    })
                    .collect(),
                _ => Vec::new(),
            }
        };
        Highlighter::new(tags("pre_tags"), tags("post_tags"))
    }

    /// Top-level metadata: everything that is not the query itself.
    fn parse_metadata(&self, body: &JsonObject) -> JsonObject {
        let mut metadata = JsonObject::new();
        for (k, v) in body {
            if matches!(k.as_str(), "query" | "bool" | "query_string" | "index_filter") {
                continue;
            }
            metadata.insert(k.clone(), v.clone());
        }
        metadata
    }

    pub(crate) fn index_context(&self) -> &dyn IndexContext {
        self.ctx
    }

    pub(crate) fn date_math_renderer(&self) -> &DateMathRenderer {
        &self.date_math
    }

    // --- query map dispatch -------------------------------------------------

    pub(crate) fn parse_query_map(&self, query_map: &JsonObject) -> SimpleQuery {
        if query_map.is_empty() {
            return SimpleQuery::new(None, true);
        }

        for (key, value) in query_map {
            let parser: Option<fn(&Self, &JsonObject) -> SimpleQuery> = match key.as_str() {
                "match_all" => Some(Self::parse_match_all),
                "match" => Some(|s, m| s.parse_match(m, false)),
                "match_phrase" => Some(|s, m| s.parse_match(m, true)),
                "multi_match" => Some(Self::parse_multi_match),
                "bool" => Some(Self::parse_bool),
                "term" => Some(Self::parse_term),
                "terms" => Some(Self::parse_terms),
                "query" => Some(Self::parse_query_map),
                "prefix" => Some(Self::parse_prefix),
                "nested" => Some(Self::parse_nested),
                "range" => Some(Self::parse_range),
                "exists" => Some(Self::parse_exists),
                "ids" => Some(Self::parse_ids),
                "constant_score" => Some(Self::parse_constant_score),
                "wildcard" => Some(Self::parse_wildcard),
                "query_string" | "simple_query_string" => Some(Self::parse_query_string),
                "regexp" => Some(Self::parse_regexp),
                "geo_bounding_box" => Some(Self::parse_geo_bounding_box),
                _ => None,
            };
            match parser {
                Some(f) => {
                    if let Value::Object(inner) = value {
                        return f(self, inner);
                    }
                    warn!(key, value = %value, "query is not a dict");
                    return SimpleQuery::invalid();
                }
                None => {
                    warn!(key, "unsupported query type");
                    return SimpleQuery::invalid();
                }
            }
        }
        SimpleQuery::invalid()
    }

    fn parse_match_all(&self, _query: &JsonObject) -> SimpleQuery {
        SimpleQuery::new(None, true)
    }

    fn parse_match(&self, query: &JsonObject, match_phrase: bool) -> SimpleQuery {
        if query.len() != 1 {
            warn!(got = query.len(), "expected exactly 1 match field");
            return SimpleQuery::invalid();
        }
        let (field_name, value) = query.iter().next().unwrap();
        let field_name = self.resolve_field(field_name);
        // either {"message": "a test"} or {"message": {"query": "a test", ...}}
        let unnested = match value {
            Value::Object(m) => m.get("query").unwrap_or(value),
            other => other,
        };

        if let Value::String(text) = unnested {
            let sub_queries: Vec<&str> =
                if match_phrase { vec![text.as_str()] } else { text.split(' ').collect() };
            let mut statements = Vec::with_capacity(sub_queries.len());
            for sub in sub_queries {
                if field_name == "_id" {
                    // synthesized ids are parsed back into timestamp predicates
                    let ids_query = self.parse_ids(&json_object(&[("values", Value::Array(vec![Value::String(sub.to_string())]))]));
                    if let Some(clause) = ids_query.where_clause {
                        statements.push(clause);
                    }
                } else {
                    statements.push(infix(
                        column(field_name.clone()),
                        "ILIKE",
                        quoted_literal(format!("%{}%", sub)),
                    ));
                }
            }
            return SimpleQuery::new(or(statements), true);
        }

        let statement =
            infix(column(field_name), "=", ast::literal(sprint(unnested)));
        SimpleQuery::new(Some(statement), true)
    }

    fn parse_multi_match(&self, query: &JsonObject) -> SimpleQuery {
        let fields = match query.get("fields") {
            Some(Value::Array(items)) => self.extract_fields(items),
            Some(other) => {
                error!(value = %other, "invalid multi_match fields type");
                return SimpleQuery::invalid();
            }
            None => self.ctx.full_text_fields(),
        };
        let always_false = ast::literal("false");
        if fields.is_empty() {
            return SimpleQuery::new(Some(always_false), true);
        }

        let Some(Value::String(query_text)) = query.get("query") else {
            warn!("no string query in multi_match");
            return SimpleQuery { where_clause: Some(always_false), ..SimpleQuery::invalid() }
        };

        let is_phrase = query.get("type").and_then(Value::as_str) == Some("phrase");
        let sub_queries: Vec<&str> =
            if is_phrase { vec![query_text.as_str()] } else { query_text.split(' ').collect() };

        let mut statements = Vec::with_capacity(fields.len() * sub_queries.len());
        for field in &fields {
            for sub in &sub_queries {
                statements.push(infix(
                    column(field.clone()),
                    "ILIKE",
                    quoted_literal(format!("%{}%", sub)),
                ));
            }
        }
        SimpleQuery::new(or(statements), true)
    }

    fn parse_bool(&self, query: &JsonObject) -> SimpleQuery {
        let mut and_statements = Vec::new();
        let mut can_parse = true;

        for and_phrase in ["must", "filter"] {
            if let Some(clauses) = query.get(and_phrase) {
                let (statements, ok) = self.parse_list_or_dict(clauses);
                and_statements.extend(statements);
                can_parse = can_parse && ok;
            }
        }
        let mut sql = and(and_statements.clone());

        let mut minimum_should_match = match query.get("minimum_should_match") {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(other) => {
                warn!(value = %other, "invalid minimum_should_match type");
                0
            }
            None => 0,
        };
        if minimum_should_match > 1 {
            warn!("minimum_should_match > 1 not supported, clamped to 1");
            minimum_should_match = 1;
        }

        if let Some(clauses) = query.get("should") {
            if minimum_should_match <= 1 {
                let (statements, ok) = self.parse_list_or_dict(clauses);
                can_parse = can_parse && ok;
                if let Some(or_sql) = or(statements) {
                    sql = match sql {
                        None => Some(or_sql),
                        Some(existing) => and(vec![existing, or_sql]),
                    };
                }
            }
        }

        if let Some(clauses) = query.get("must_not") {
            let (statements, ok) = self.parse_list_or_dict(clauses);
            can_parse = can_parse && ok;
            let nots: Vec<Expr> =
                statements.into_iter().map(|s| prefix("NOT", vec![s])).collect();
            if let Some(not_sql) = and(nots) {
                sql = match sql {
                    None => Some(not_sql),
                    Some(existing) => and(vec![existing, not_sql]),
                };
            }
        }

        SimpleQuery::new(sql, can_parse)
    }

    /// bool sub-clauses come as either a list of query maps or a single one.
    fn parse_list_or_dict(&self, clauses: &Value) -> (Vec<Expr>, bool) {
        match clauses {
            Value::Array(items) => {
                let mut statements = Vec::with_capacity(items.len());
                let mut can_parse = true;
                for item in items {
                    match item {
                        Value::Object(m) => {
                            let q = self.parse_query_map(m);
                            can_parse = can_parse && q.can_parse;
                            if let Some(clause) = q.where_clause {
                                statements.push(clause);
                            }
                        }
                        other => {
                            warn!(value = %other, "invalid bool clause type");
                            can_parse = false;
                        }
                    }
                }
                (statements, can_parse)
            }
            Value::Object(m) => {
                let q = self.parse_query_map(m);
                (q.where_clause.into_iter().collect(), q.can_parse)
            }
            other => {
                warn!(value = %other, "invalid bool clause type");
                (Vec::new(), false)
            }
        }
    }

    fn parse_term(&self, query: &JsonObject) -> SimpleQuery {
        if query.len() != 1 {
            warn!(got = query.len(), "expected exactly 1 term");
            return SimpleQuery::invalid();
        }
        let (key, value) = query.iter().next().unwrap();
        if key == "_index" {
            // index name is already pinned by the URL; annotate a no-op
            warn!(value = %value, "term _index in query body, ignoring in result SQL");
            let clause = infix(
                ast::literal("0"),
                "=",
                ast::literal(format!("0 /* {}={} */", key, sprint(value))),
            );
            return SimpleQuery::new(Some(clause), true);
        }
        let field = self.resolve_field(key);
        let clause = infix(column(field), "=", ast::literal(sprint(value)));
        SimpleQuery::new(Some(clause), true)
    }

    fn parse_terms(&self, query: &JsonObject) -> SimpleQuery {
        if query.len() != 1 {
            warn!(got = query.len(), "expected exactly 1 terms field");
            return SimpleQuery::invalid();
        }
        let (key, value) = query.iter().next().unwrap();
        if key.starts_with('_') {
            // terms-enum internals (_tier etc.) must not reach the SQL
            return SimpleQuery::new(None, true);
        }
        let Value::Array(values) = value else {
            warn!(value = %value, "invalid terms type");
            return SimpleQuery::invalid();
        };
        let field = self.resolve_field(key);
        if values.len() == 1 {
            let clause = infix(column(field), "=", ast::literal(sprint(&values[0])));
            return SimpleQuery::new(Some(clause), true);
        }
        let rendered: Vec<String> = values.iter().map(sprint).collect();
        let clause = infix(
            column(field),
            "IN",
            ast::literal(format!("({})", rendered.join(","))),
        );
        SimpleQuery::new(Some(clause), true)
    }

    fn parse_prefix(&self, query: &JsonObject) -> SimpleQuery {
        if query.len() != 1 {
            warn!(got = query.len(), "expected exactly 1 prefix");
            return SimpleQuery::invalid();
        }
        let (field_name, value) = query.iter().next().unwrap();
        let field = self.resolve_field(field_name);
        let token = match value {
            Value::String(s) => s.clone(),
            Value::Object(m) => match m.get("value") {
                Some(Value::String(s)) => s.clone(),
                other => {
                    warn!(value = ?other, "unsupported prefix value");
                    return SimpleQuery::invalid();
                }
            },
            other => {
                warn!(value = %other, "unsupported prefix type");
                return SimpleQuery::invalid();
            }
        };
        let clause = infix(column(field), "ILIKE", quoted_literal(format!("{}%", token)));
        SimpleQuery::new(Some(clause), true)
    }

    fn parse_wildcard(&self, query: &JsonObject) -> SimpleQuery {
        if query.len() != 1 {
            warn!(got = query.len(), "expected exactly 1 wildcard");
            return SimpleQuery::invalid();
        }
        let (field_name, value) = query.iter().next().unwrap();
        let field = self.resolve_field(field_name);
        let Value::Object(params) = value else {
            warn!(value = %value, "invalid wildcard type");
            return SimpleQuery::invalid();
        };
        let Some(Value::String(pattern)) = params.get("value") else {
            warn!("no value in wildcard query");
            return SimpleQuery::invalid();
        };
        let clause = infix(
            column(field),
            "ILIKE",
            quoted_literal(pattern.replace('*', "%")),
        );
        SimpleQuery::new(Some(clause), true)
    }

    fn parse_regexp(&self, query: &JsonObject) -> SimpleQuery {
        if query.len() != 1 {
            warn!(got = query.len(), "expected exactly 1 regexp");
            return SimpleQuery::invalid();
        }
        let (field_name, params_raw) = query.iter().next().unwrap();
        let field = self.resolve_field(field_name);
        let Value::Object(params) = params_raw else {
            warn!(value = %params_raw, "invalid regexp parameters type");
            return SimpleQuery::invalid();
        };
        let Some(Value::String(pattern)) = params.get("value") else {
            warn!("no value in regexp query");
            return SimpleQuery::invalid();
        };
        if params.len() > 1 {
            warn!(?params, "unsupported regexp parameters");
        }

        // Out of all regex metacharacters, only `.` and `.*` are allowed for
        // the LIKE downgrade; the native REGEXP is much slower.
        let really_simple = !pattern.contains(|c: char| {
            matches!(c, '?' | '+' | '|' | '{' | '}' | '[' | ']' | '(' | ')' | '"' | '\\')
        }) && !pattern.starts_with('*')
            && pattern
                .char_indices()
                .all(|(i, c)| c != '*' || (i > 0 && pattern.as_bytes()[i - 1] == b'.'));

        let (op, pattern) = if really_simple {
            let translated = pattern
                .replace('_', "\\_")
                .replace(".*", "%")
                .replace('.', "_");
            ("LIKE", translated)
        } else {
            ("REGEXP", pattern.clone())
        };
        let clause = infix(column(field), op, quoted_literal(pattern));
        SimpleQuery::new(Some(clause), true)
    }

    fn parse_range(&self, query: &JsonObject) -> SimpleQuery {
        if query.len() != 1 {
            warn!(got = query.len(), "expected exactly 1 range");
            return SimpleQuery::invalid();
        }
        let (field_raw, spec) = query.iter().next().unwrap();
        let field = self.resolve_field(field_raw);
        let Value::Object(spec) = spec else {
            warn!(value = %spec, "invalid range type");
            return SimpleQuery::invalid();
        };

        // in nearly all requests format is strict_date_optional_time, which
        // ISO-8601 parsing covers; only epoch_millis changes the plan
        let epoch_millis =
            spec.get("format").and_then(Value::as_str) == Some("epoch_millis");

        let mut statements = Vec::new();
        let mut keys: Vec<&String> = spec.keys().collect();
        keys.sort();
        for op_key in keys {
            let value = &spec[op_key];
            let op = match op_key.as_str() {
                "gte" => ">=",
                "lte" => "<=",
                "gt" => ">",
                "lt" => "<",
                "format" => continue,
                other => {
                    warn!(op = other, "invalid range operator");
                    continue;
                }
            };

            let mut lhs = column(field.clone());
            let mut printed = sprint(value);
            let mut rhs = ast::literal(printed.clone());
            if epoch_millis {
                lhs = function("toUnixTimestamp64Milli", vec![column(field.clone())]);
            } else {
                match self.ctx.date_time_kind(&field) {
                    kind @ (DateTimeKind::DateTime | DateTimeKind::DateTime64) => {
                        if let Value::String(date_time) = value {
                            if is_iso8601(date_time) {
                                let parse_fn = match kind {
                                    DateTimeKind::DateTime64 => "parseDateTime64BestEffort",
                                    _ => "parseDateTimeBestEffort",
                                };
                                rhs = function(parse_fn, vec![quoted_literal(date_time)]);
                            } else {
                                match datemath::parse(&date_time.replace('\'', "")) {
                                    Some(expr) => {
                                        rhs = ast::literal(self.date_math.render(&expr));
                                    }
                                    None => {
                                        warn!(value = %date_time, "error parsing date math expression");
                                        return SimpleQuery::invalid();
                                    }
                                }
                            }
                        } else if value.is_null() {
                            rhs = ast::literal("NULL");
                        }
                    }
                    DateTimeKind::Invalid => {
                        // a number that arrived quoted gets its quotes stripped
                        if printed.len() > 2 && printed.starts_with('\'') && printed.ends_with('\'')
                        {
                            let inner = &printed[1..printed.len() - 1];
                            if inner.chars().all(|c| c.is_ascii_digit() || c == '.') {
                                printed = inner.to_string();
                            } else {
                                warn!(value = %printed, field = %field, "range with unknown literal");
                            }
                            rhs = ast::literal(printed.clone());
                        }
                    }
                }
            }

            statements.push(infix(lhs, op, rhs));
        }
        SimpleQuery::with_field_name(and(statements), true, &field)
    }

    fn parse_exists(&self, query: &JsonObject) -> SimpleQuery {
        let mut sql = None;
        for value in query.values() {
            let Value::String(field_name) = value else {
                warn!(value = %value, "invalid exists type");
                return SimpleQuery::invalid();
            };
            let field = self.resolve_field(field_name);
            match self.ctx.field_kind(&field) {
                FieldKind::BaseType => {
                    sql = Some(infix(column(field), "IS", ast::literal("NOT NULL")));
                }
                FieldKind::Array => {
                    // kept as-is from the source system: tests size0 = 0,
                    // which is the inverse of "exists"
                    sql = Some(infix(
                        nested_property(ast::ColumnRef { column_name: field }, "size0"),
                        "=",
                        ast::literal("0"),
                    ));
                }
                FieldKind::NotExists => {
                    if self.ctx.is_geo_point(&field) {
                        return SimpleQuery::new(sql, true);
                    }
                    let mut clauses = Vec::new();
                    for attrs in self.ctx.attribute_arrays() {
                        let has = function(
                            "has",
                            vec![column(attrs.keys_column.clone()), quoted_literal(&field)],
                        );
                        let value_at = ast::array_access(
                            ast::ColumnRef { column_name: attrs.values_column.clone() },
                            function(
                                "indexOf",
                                vec![column(attrs.keys_column), quoted_literal(&field)],
                            ),
                        );
                        let not_null = infix(value_at, "IS", ast::literal("NOT NULL"));
                        clauses.push(and(vec![has, not_null]).unwrap_or(ast::literal("false")));
                    }
                    sql = or(clauses);
                }
            }
        }
        SimpleQuery::new(sql, true)
    }

    fn parse_ids(&self, query: &JsonObject) -> SimpleQuery {
        let Some(Value::Array(values)) = query.get("values") else {
            error!("missing mandatory values field in ids query");
            return SimpleQuery::invalid();
        };
        let ids: Vec<String> = values
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect();
        warn!(ids = ?ids, "unsupported id query executed");

        let Some(ts_column) = self.ctx.timestamp_column() else {
            warn!("id query executed, but no timestamp field configured");
            return SimpleQuery::new(None, true);
        };
        if ids.is_empty() {
            warn!("empty _id array");
            return SimpleQuery::invalid();
        }

        // a synthesized id is `hex(timestamp text) q digits`; strip the part
        // after `q`, hex-decode, and the timestamp text comes back out
        let mut timestamps = Vec::with_capacity(ids.len());
        for id in &ids {
            let hex_part = id.split('q').next().unwrap_or_default();
            match hex_decode(hex_part).and_then(|bytes| String::from_utf8(bytes).ok()) {
                Some(decoded) => {
                    let trimmed = decoded.trim_end_matches(" +0000 UTC").to_string();
                    timestamps.push(trimmed);
                }
                None => {
                    error!(id = %id, "error parsing document id");
                    return SimpleQuery::new(None, true);
                }
            }
        }

        let to_datetime = |ts: &str| -> Option<Expr> {
            match self.ctx.date_time_kind(&ts_column) {
                DateTimeKind::DateTime64 => Some(function(
                    "toDateTime64",
                    vec![quoted_literal(ts), ast::literal("3")],
                )),
                DateTimeKind::DateTime => {
                    Some(function("toDateTime", vec![quoted_literal(ts)]))
                }
                DateTimeKind::Invalid => None,
            }
        };

        let converted: Option<Vec<Expr>> =
            timestamps.iter().map(|ts| to_datetime(ts)).collect();
        let Some(converted) = converted else {
            warn!(column = %ts_column, "timestamp field of unsupported type");
            return SimpleQuery::new(None, true);
        };

        let clause = if converted.len() == 1 {
            infix(column(ts_column), "=", converted.into_iter().next().unwrap())
        } else {
            infix(column(ts_column), "IN", paren(converted))
        };
        SimpleQuery::new(Some(clause), true)
    }

    /// `constant_score` is a wrapper around `filter` whose scoring we ignore.
    fn parse_constant_score(&self, query: &JsonObject) -> SimpleQuery {
        if query.contains_key("filter") {
            self.parse_bool(query)
        } else {
            error!("constant_score needs to wrap a filter query");
            SimpleQuery::invalid()
        }
    }

    fn parse_query_string(&self, query: &JsonObject) -> SimpleQuery {
        let fields = match query.get("fields") {
            Some(Value::Array(items)) => self.extract_fields(items),
            _ => self.ctx.full_text_fields(),
        };
        let Some(Value::String(text)) = query.get("query") else {
            warn!("no query in query_string");
            return SimpleQuery::invalid();
        };
        // the Lucene translator degrades invalid queries to FALSE on its own
        let clause = lucene::translate_to_sql(text, &fields);
        SimpleQuery::new(Some(clause), true)
    }

    fn parse_nested(&self, query: &JsonObject) -> SimpleQuery {
        // tables are flat; nested is a passthrough of the inner query
        match query.get("query") {
            Some(Value::Object(inner)) => self.parse_query_map(inner),
            Some(other) => {
                warn!(value = %other, "invalid nested query type");
                SimpleQuery::invalid()
            }
            None => {
                warn!("no query in nested query");
                SimpleQuery::invalid()
            }
        }
    }

    fn parse_geo_bounding_box(&self, query: &JsonObject) -> SimpleQuery {
        let mut statements = Vec::new();
        for (field, value) in query {
            let corner = |name: &str| -> Option<Vec<Expr>> {
                match value.get(name) {
                    Some(Value::Array(coords)) if coords.len() == 2 => Some(
                        coords.iter().map(|c| ast::literal(plain_print(c))).collect(),
                    ),
                    _ => None,
                }
            };
            let Some(top_left) = corner("top_left") else {
                warn!("no top_left in geo_bounding_box query");
                return SimpleQuery::invalid();
            };
            let Some(bottom_right) = corner("bottom_right") else {
                warn!("no bottom_right in geo_bounding_box query");
                return SimpleQuery::invalid();
            };
            // abstract geo call, mapped to a database function by a later
            // rewrite pass
            let mut args = vec![column(self.resolve_field(field))];
            args.extend(top_left);
            args.extend(bottom_right);
            statements.push(function("GEO_BOUNDING_BOX", args));
        }
        SimpleQuery::new(and(statements), true)
    }

    // --- metadata classification -------------------------------------------

    fn try_process_search_metadata(&self, metadata: &JsonObject) -> SearchQueryInfo {
        if let Some(info) = self.is_facets_request(metadata) {
            return info;
        }
        if let Some(info) = self.is_list_request(metadata) {
            return info;
        }
        SearchQueryInfo::normal()
    }

    fn is_facets_request(&self, metadata: &JsonObject) -> Option<SearchQueryInfo> {
        let sample = metadata.get("aggs")?.get("sample")?.as_object()?;
        let aggs = sample.get("aggs")?.as_object()?;

        aggs.get("sample_count")?;
        let terms = aggs.get("top_values")?.get("terms")?.as_object()?;
        let size = terms.get("size")?.as_u64()? as usize;
        let field_raw = terms.get("field")?.as_str()?;
        let field = self.resolve_field(field_raw.trim_end_matches(".keyword"));

        let shard_size =
            sample.get("sampler")?.get("shard_size")?.as_u64()? as usize;

        let kind = match aggs.len() {
            2 => SearchQueryKind::Facets { field, top_n: size, sample_limit: shard_size },
            4 if aggs.contains_key("min_value") && aggs.contains_key("max_value") => {
                SearchQueryKind::FacetsNumeric { field, top_n: size, sample_limit: shard_size }
            }
            _ => return None,
        };
        Some(SearchQueryInfo { kind, ..SearchQueryInfo::normal() })
    }

    fn is_list_request(&self, metadata: &JsonObject) -> Option<SearchQueryInfo> {
        if metadata.contains_key("aggs") || metadata.contains_key("aggregations") {
            return None;
        }
        let size = match metadata.get("size") {
            None => DEFAULT_SIZE,
            Some(Value::Number(n)) => n.as_u64().unwrap_or(DEFAULT_SIZE as u64) as usize,
            Some(_) => DEFAULT_SIZE,
        };
        if size == 0 {
            return None;
        }

        let all = Some(SearchQueryInfo {
            kind: SearchQueryKind::ListAllFields,
            size,
            ..SearchQueryInfo::normal()
        });

        let fields = match metadata.get("fields") {
            None => return all,
            Some(Value::Array(items)) => items,
            Some(_) => return None,
        };

        match fields.len() {
            0 => None,
            1 => {
                let field_name = match &fields[0] {
                    Value::String(s) => s.clone(),
                    Value::Object(m) => m.get("field")?.as_str()?.to_string(),
                    _ => return None,
                };
                let resolved = self.resolve_field(&field_name);
                if resolved == "*" {
                    all
                } else {
                    Some(SearchQueryInfo {
                        kind: SearchQueryKind::ListByField { field: resolved },
                        size,
                        ..SearchQueryInfo::normal()
                    })
                }
            }
            _ => {
                // everywhere observed so far, >1 requested field includes "*"
                debug!("requested more than one field, falling back to all fields");
                all
            }
        }
    }

    /// Sort entries on `_`-prefixed fields are dropped unless the field
    /// actually exists in the schema.
    fn parse_sort_fields(&self, sort: &Value) -> Vec<OrderByExpr> {
        let mut columns = Vec::new();
        match sort {
            Value::Array(entries) => {
                for entry in entries {
                    match entry {
                        Value::Object(m) => {
                            for (k, v) in m {
                                if let Some(col) = self.parse_one_sort_field(k, v) {
                                    columns.push(col);
                                }
                            }
                        }
                        Value::String(field) => {
                            if let Some(col) =
                                self.parse_one_sort_field(field, &Value::String("asc".into()))
                            {
                                columns.push(col);
                            }
                        }
                        other => {
                            warn!(value = %other, "unexpected sort entry type");
                        }
                    }
                }
            }
            Value::Object(m) => {
                for (k, v) in m {
                    if let Some(col) = self.parse_one_sort_field(k, v) {
                        columns.push(col);
                    }
                }
            }
            other => {
                error!(value = %other, "unexpected sort type");
            }
        }
        columns
    }

    fn parse_one_sort_field(&self, field: &str, value: &Value) -> Option<OrderByExpr> {
        let resolved = self.resolve_field(field);
        if field.starts_with('_') && self.ctx.field_kind(&resolved) == FieldKind::NotExists {
            // ELK internals like _doc or _score never reach the SQL
            return None;
        }
        let order = match value {
            Value::Object(m) => m.get("order").and_then(Value::as_str).unwrap_or("asc"),
            Value::String(s) => s.as_str(),
            other => {
                warn!(field, value = %other, "unexpected sort value type, skipping");
                return None;
            }
        };
        match order.to_lowercase().as_str() {
            "asc" => Some(sort_column(resolved, OrderByDirection::Asc)),
            "desc" => Some(sort_column(resolved, OrderByDirection::Desc)),
            other => {
                warn!(field, order = other, "unexpected order value, skipping");
                None
            }
        }
    }

    // --- plan builders ------------------------------------------------------

    fn build_count_query_if_needed(
        &self,
        simple: &SimpleQuery,
        info: &SearchQueryInfo,
    ) -> Option<Query> {
        if info.track_total_hits == track_total_hits::FALSE {
            return None;
        }
        if info.track_total_hits <= info.size as i64 {
            return None;
        }
        Some(self.build_count_query(simple.where_clause.clone(), info.track_total_hits as usize))
    }

    /// `SELECT count(*)`, counting at most `limit` rows when `limit > 0`.
    pub fn build_count_query(&self, where_clause: Option<Expr>, limit: usize) -> Query {
        let select = if limit > 0 {
            let inner = SelectCommand::new(
                vec![ast::literal("1")],
                vec![],
                vec![],
                Some(table(self.ctx.table_name())),
                where_clause,
                limit,
                0,
                false,
            );
            SelectCommand::new(
                vec![count_star()],
                vec![],
                vec![],
                Some(Expr::Select(Box::new(inner))),
                None,
                0,
                0,
                false,
            )
        } else {
            SelectCommand::new(
                vec![count_star()],
                vec![],
                vec![],
                Some(table(self.ctx.table_name())),
                where_clause,
                0,
                0,
                false,
            )
        };
        Query {
            select,
            table_name: self.ctx.table_name().to_string(),
            shaper: Box::new(CountShaper),
            plan_kind: PlanKind::Count,
            agg_path: Vec::new(),
            group_by_depth: 0,
            pipeline_parent: None,
            highlighter: None,
        }
    }

    fn build_facets_query_if_needed(
        &self,
        simple: &SimpleQuery,
        info: &SearchQueryInfo,
    ) -> Option<Query> {
        let (field, top_n, sample_limit, numeric) = match &info.kind {
            SearchQueryKind::Facets { field, top_n, sample_limit } => {
                (field, *top_n, *sample_limit, false)
            }
            SearchQueryKind::FacetsNumeric { field, top_n, sample_limit } => {
                (field, *top_n, *sample_limit, true)
            }
            _ => return None,
        };

        let inner = SelectCommand::new(
            vec![column(field.clone())],
            vec![],
            vec![],
            Some(table(self.ctx.table_name())),
            simple.where_clause.clone(),
            0,
            sample_limit,
            false,
        );
        let select = SelectCommand::new(
            vec![aliased(column(field.clone()), "key"), aliased(count_star(), "doc_count")],
            vec![column(field.clone())],
            vec![OrderByExpr {
                exprs: vec![count_star()],
                direction: OrderByDirection::Desc,
            }],
            Some(Expr::Select(Box::new(inner))),
            None,
            top_n,
            0,
            false,
        );
        Some(Query {
            select,
            table_name: self.ctx.table_name().to_string(),
            shaper: Box::new(FacetsShaper { numeric }),
            plan_kind: PlanKind::Facets,
            agg_path: Vec::new(),
            group_by_depth: 0,
            pipeline_parent: None,
            highlighter: None,
        })
    }

    fn build_list_query_if_needed(
        &self,
        simple: &SimpleQuery,
        info: &SearchQueryInfo,
        highlighter: &Highlighter,
    ) -> Option<Query> {
        let (field, size) = match &info.kind {
            SearchQueryKind::ListByField { field } => (Some(field.clone()), info.size),
            SearchQueryKind::ListAllFields => (None, info.size),
            _ => return None,
        };
        Some(self.build_n_rows_query(field, simple, size, highlighter.clone()))
    }

    /// `SELECT <field or *> ... ORDER BY ... LIMIT n` plus the hits shaper.
    pub fn build_n_rows_query(
        &self,
        field: Option<String>,
        simple: &SimpleQuery,
        limit: usize,
        mut highlighter: Highlighter,
    ) -> Query {
        let columns = match field {
            Some(f) if f != "*" => vec![column(f)],
            _ => vec![wildcard()],
        };
        let select = SelectCommand::new(
            columns,
            vec![],
            simple.order_by.clone(),
            Some(table(self.ctx.table_name())),
            simple.where_clause.clone(),
            limit,
            0,
            false,
        );
        highlighter.set_tokens_from(&select);
        let shaper = HitsShaper {
            table_name: self.ctx.table_name().to_string(),
            timestamp_column: self.ctx.timestamp_column(),
            highlighter: highlighter.clone(),
            sort_field_names: select.order_by_field_names(),
            aliases: self.ctx.aliases(),
            add_source: true,
        };
        Query {
            select,
            table_name: self.ctx.table_name().to_string(),
            shaper: Box::new(shaper),
            plan_kind: PlanKind::Hits,
            agg_path: Vec::new(),
            group_by_depth: 0,
            pipeline_parent: None,
            highlighter: Some(highlighter),
        }
    }

    // --- helpers ------------------------------------------------------------

    fn resolve_field(&self, name: &str) -> String {
        let resolved = self.ctx.resolve_field(name);
        if resolved != "*"
            && !matches!(name, "_all" | "_doc" | "_id" | "_index")
            && !self.ctx.has_field(&resolved)
        {
            debug!(field = name, "field referenced, but not found in schema");
        }
        resolved
    }

    fn extract_fields(&self, fields: &[Value]) -> Vec<String> {
        let mut out = Vec::new();
        for field in fields {
            let Value::String(name) = field else {
                warn!(value = %field, "invalid field type");
                continue;
            };
            if name == "*" {
                return self.ctx.full_text_fields();
            }
            out.push(self.resolve_field(name));
        }
        out
    }
}

/// Formats a JSON value the way the database expects it as a literal:
/// strings quoted, `{value: ...}` unwrapped, everything else verbatim.
pub(crate) fn sprint(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "\\'")),
        Value::Object(m) => match m.get("value") {
            Some(inner) => sprint(inner),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}

/// Like `sprint` but without quoting, for numeric coordinates.
fn plain_print(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_iso8601(s: &str) -> bool {
    if chrono::DateTime::parse_from_rfc3339(s).is_ok() {
        return true;
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

fn json_object(entries: &[(&str, Value)]) -> JsonObject {
    entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::StaticContext;
    use crate::sql::{expr_to_sql, select_to_sql};
    use serde_json::json;

    fn ctx() -> StaticContext {
        StaticContext::new("logs")
            .with_column("message", "String")
            .with_column("host", "String")
            .with_column("timestamp", "DateTime64(3)")
            .with_column("time_taken", "UInt32")
            .with_timestamp("timestamp")
            .with_full_text(&["message"])
    }

    fn parse_where(ctx: &StaticContext, body: serde_json::Value) -> String {
        let translator = QueryTranslator::new(ctx, DateMathRenderer::ClickhouseInterval);
        let (simple, _, _) = translator.parse_query_internal(&body);
        assert!(simple.can_parse, "query should parse: {}", body);
        simple.where_clause.map(|w| expr_to_sql(&w)).unwrap_or_default()
    }

    #[test]
    fn test_match_all_and_empty_query() {
        let ctx = ctx();
        assert_eq!(parse_where(&ctx, json!({"query": {"match_all": {}}})), "");
        assert_eq!(parse_where(&ctx, json!({})), "");
    }

    #[test]
    fn test_match_splits_on_spaces() {
        let ctx = ctx();
        assert_eq!(
            parse_where(&ctx, json!({"query": {"match": {"message": "error timeout"}}})),
            r#"("message" ILIKE '%error%' OR "message" ILIKE '%timeout%')"#
        );
    }

    #[test]
    fn test_match_phrase_keeps_whole_string() {
        let ctx = ctx();
        assert_eq!(
            parse_where(&ctx, json!({"query": {"match_phrase": {"message": "error timeout"}}})),
            r#""message" ILIKE '%error timeout%'"#
        );
    }

    #[test]
    fn test_range_datetime64_renders_best_effort_parse() {
        let ctx = ctx();
        assert_eq!(
            parse_where(
                &ctx,
                json!({"query": {"range": {"timestamp": {
                    "format": "strict_date_optional_time",
                    "gte": "2024-02-02T13:47:16.029Z",
                    "lte": "2024-02-09T13:47:16.029Z"
                }}}})
            ),
            r#"("timestamp" >= parseDateTime64BestEffort('2024-02-02T13:47:16.029Z') AND "timestamp" <= parseDateTime64BestEffort('2024-02-09T13:47:16.029Z'))"#
        );
    }

    #[test]
    fn test_range_datetime_renders_plain_best_effort() {
        let ctx = StaticContext::new("logs")
            .with_column("timestamp", "DateTime")
            .with_timestamp("timestamp");
        assert_eq!(
            parse_where(
                &ctx,
                json!({"query": {"range": {"timestamp": {"gte": "2024-02-02T13:47:16"}}}})
            ),
            r#""timestamp" >= parseDateTimeBestEffort('2024-02-02T13:47:16')"#
        );
    }

    #[test]
    fn test_range_numeric_strips_accidental_quotes() {
        let ctx = ctx();
        assert_eq!(
            parse_where(&ctx, json!({"query": {"range": {"time_taken": {"gt": "100"}}}})),
            r#""time_taken" > 100"#
        );
    }

    #[test]
    fn test_range_epoch_millis_wraps_lhs() {
        let ctx = ctx();
        assert_eq!(
            parse_where(
                &ctx,
                json!({"query": {"range": {"timestamp": {"format": "epoch_millis", "gte": 1707486436029u64}}}})
            ),
            r#"toUnixTimestamp64Milli("timestamp") >= 1707486436029"#
        );
    }

    #[test]
    fn test_range_date_math() {
        let ctx = ctx();
        assert_eq!(
            parse_where(&ctx, json!({"query": {"range": {"timestamp": {"gte": "now-1d/d"}}}})),
            r#""timestamp" >= toStartOfDay(subDate(now(), INTERVAL 1 day))"#
        );
    }

    #[test]
    fn test_wildcard_becomes_ilike() {
        let ctx = ctx();
        assert_eq!(
            parse_where(&ctx, json!({"query": {"wildcard": {"message": {"value": "foo*bar"}}}})),
            r#""message" ILIKE 'foo%bar'"#
        );
    }

    #[test]
    fn test_prefix_both_shapes() {
        let ctx = ctx();
        assert_eq!(
            parse_where(&ctx, json!({"query": {"prefix": {"host": "web"}}})),
            r#""host" ILIKE 'web%'"#
        );
        assert_eq!(
            parse_where(&ctx, json!({"query": {"prefix": {"host": {"value": "web"}}}})),
            r#""host" ILIKE 'web%'"#
        );
    }

    #[test]
    fn test_regexp_simple_pattern_downgrades_to_like() {
        let ctx = ctx();
        assert_eq!(
            parse_where(&ctx, json!({"query": {"regexp": {"host": {"value": "web.*prod"}}}})),
            r#""host" LIKE 'web%prod'"#
        );
    }

    #[test]
    fn test_regexp_complex_pattern_stays_native() {
        let ctx = ctx();
        assert_eq!(
            parse_where(&ctx, json!({"query": {"regexp": {"host": {"value": "web[0-9]+"}}}})),
            r#""host" REGEXP 'web[0-9]+'"#
        );
    }

    #[test]
    fn test_term_and_terms() {
        let ctx = ctx();
        assert_eq!(
            parse_where(&ctx, json!({"query": {"term": {"host": "web-1"}}})),
            r#""host" = 'web-1'"#
        );
        assert_eq!(
            parse_where(&ctx, json!({"query": {"terms": {"host": ["a"]}}})),
            r#""host" = 'a'"#
        );
        assert_eq!(
            parse_where(&ctx, json!({"query": {"terms": {"host": ["a", "b"]}}})),
            r#""host" IN ('a','b')"#
        );
    }

    #[test]
    fn test_term_index_key_is_elided() {
        let ctx = ctx();
        let clause = parse_where(&ctx, json!({"query": {"term": {"_index": "logs"}}}));
        assert!(clause.starts_with("0 = 0"));
    }

    #[test]
    fn test_internal_terms_collapse_to_true() {
        let ctx = ctx();
        assert_eq!(parse_where(&ctx, json!({"query": {"terms": {"_tier": ["data_hot"]}}})), "");
    }

    #[test]
    fn test_bool_combines_clauses() {
        let ctx = ctx();
        assert_eq!(
            parse_where(
                &ctx,
                json!({"query": {"bool": {
                    "must": [{"term": {"host": "a"}}],
                    "filter": [{"term": {"host": "b"}}],
                    "should": [{"term": {"host": "c"}}],
                    "must_not": [{"term": {"host": "d"}}]
                }}})
            ),
            r#"((("host" = 'a' AND "host" = 'b') AND "host" = 'c') AND NOT ("host" = 'd'))"#
        );
    }

    #[test]
    fn test_bool_minimum_should_match_clamped() {
        let ctx = ctx();
        // >1 is clamped to 1, so the should clause still lands in the SQL
        assert_eq!(
            parse_where(
                &ctx,
                json!({"query": {"bool": {
                    "must": [{"term": {"host": "a"}}],
                    "should": [{"term": {"host": "b"}}],
                    "minimum_should_match": 3
                }}})
            ),
            r#"("host" = 'a' AND "host" = 'b')"#
        );
    }

    #[test]
    fn test_multi_match_cross_product() {
        let ctx = StaticContext::new("logs")
            .with_column("message", "String")
            .with_column("body", "String")
            .with_full_text(&["message", "body"]);
        assert_eq!(
            parse_where(
                &ctx,
                json!({"query": {"multi_match": {"query": "a b", "fields": ["message", "body"]}}})
            ),
            r#"((("message" ILIKE '%a%' OR "message" ILIKE '%b%') OR "body" ILIKE '%a%') OR "body" ILIKE '%b%')"#
        );
    }

    #[test]
    fn test_multi_match_without_fields_uses_full_text() {
        let ctx = ctx();
        assert_eq!(
            parse_where(&ctx, json!({"query": {"multi_match": {"query": "x", "type": "phrase"}}})),
            r#""message" ILIKE '%x%'"#
        );
    }

    #[test]
    fn test_multi_match_empty_fields_is_constant_false() {
        let ctx = StaticContext::new("logs");
        assert_eq!(
            parse_where(&ctx, json!({"query": {"multi_match": {"query": "x"}}})),
            "false"
        );
    }

    #[test]
    fn test_exists_base_type() {
        let ctx = ctx();
        assert_eq!(
            parse_where(&ctx, json!({"query": {"exists": {"field": "host"}}})),
            r#""host" IS NOT NULL"#
        );
    }

    #[test]
    fn test_exists_array_keeps_inverted_size0() {
        let ctx = ctx().with_column("tags", "Array(String)");
        assert_eq!(
            parse_where(&ctx, json!({"query": {"exists": {"field": "tags"}}})),
            r#""tags".size0 = 0"#
        );
    }

    #[test]
    fn test_exists_undeclared_searches_attribute_arrays() {
        let ctx = ctx().with_attributes("attributes_string_key", "attributes_string_value");
        assert_eq!(
            parse_where(&ctx, json!({"query": {"exists": {"field": "mystery"}}})),
            r#"(has("attributes_string_key",'mystery') AND "attributes_string_value"[indexOf("attributes_string_key",'mystery')] IS NOT NULL)"#
        );
    }

    #[test]
    fn test_constant_score_passthrough() {
        let ctx = ctx();
        assert_eq!(
            parse_where(
                &ctx,
                json!({"query": {"constant_score": {"filter": {"term": {"host": "a"}}}}})
            ),
            r#""host" = 'a'"#
        );
    }

    #[test]
    fn test_nested_passthrough() {
        let ctx = ctx();
        assert_eq!(
            parse_where(
                &ctx,
                json!({"query": {"nested": {"path": "x", "query": {"term": {"host": "a"}}}}})
            ),
            r#""host" = 'a'"#
        );
    }

    #[test]
    fn test_geo_bounding_box_collects_abstract_call() {
        let ctx = ctx().with_geo_point("location");
        assert_eq!(
            parse_where(
                &ctx,
                json!({"query": {"geo_bounding_box": {"location": {
                    "top_left": [40.73, -74.1],
                    "bottom_right": [40.01, -71.12]
                }}}})
            ),
            r#"GEO_BOUNDING_BOX("location",40.73,-74.1,40.01,-71.12)"#
        );
    }

    #[test]
    fn test_ids_roundtrip_from_synthesized_id() {
        let ctx = ctx();
        // hex("2024-02-02 13:47:16.029") + "q1"
        let ts = "2024-02-02 13:47:16.029";
        let id: String = ts.bytes().map(|b| format!("{:02x}", b)).chain(["q1".to_string()]).collect();
        let clause = parse_where(&ctx, json!({"query": {"ids": {"values": [id]}}}));
        assert_eq!(clause, r#""timestamp" = toDateTime64('2024-02-02 13:47:16.029',3)"#);
    }

    #[test]
    fn test_unknown_query_kind_is_terminal() {
        let ctx = ctx();
        let translator = QueryTranslator::new(&ctx, DateMathRenderer::ClickhouseInterval);
        let (simple, _, _) = translator
            .parse_query_internal(&json!({"query": {"knn_search": {"field": "v"}}}));
        assert!(!simple.can_parse);
        let (queries, ok) = translator.parse_query(&json!({"query": {"knn_search": {}}}));
        assert!(!ok);
        assert!(queries.is_empty());
    }

    #[test]
    fn test_parse_is_total_on_garbage() {
        let ctx = ctx();
        let translator = QueryTranslator::new(&ctx, DateMathRenderer::ClickhouseInterval);
        for body in [
            json!(null),
            json!(42),
            json!("string body"),
            json!({"query": 42}),
            json!({"query": {"match": 17}}),
            json!({"query": {"range": {"timestamp": "not a map"}}}),
            json!({"query": {"bool": {"must": "oops"}}}),
            json!({"query": {"terms": {"host": "not-an-array"}}}),
        ] {
            let (_, ok) = translator.parse_query(&body);
            assert!(!ok, "expected rejection for {}", body);
        }
    }

    #[test]
    fn test_sort_drops_unknown_underscore_fields() {
        let ctx = ctx();
        let translator = QueryTranslator::new(&ctx, DateMathRenderer::ClickhouseInterval);
        let (simple, _, _) = translator.parse_query_internal(&json!({
            "query": {"match_all": {}},
            "sort": [
                {"timestamp": {"order": "desc"}},
                {"_score": {"order": "desc"}},
                "host"
            ]
        }));
        let names: Vec<String> = simple
            .order_by
            .iter()
            .flat_map(|ob| ob.exprs.iter())
            .filter_map(|e| match e {
                Expr::ColumnRef(c) => Some(c.column_name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["timestamp".to_string(), "host".to_string()]);
    }

    #[test]
    fn test_facets_classification() {
        let ctx = StaticContext::new("logs").with_column("host.name", "String");
        let translator = QueryTranslator::new(&ctx, DateMathRenderer::ClickhouseInterval);
        let (_, info, _) = translator.parse_query_internal(&json!({
            "aggs": {"sample": {
                "sampler": {"shard_size": 5000},
                "aggs": {
                    "sample_count": {"value_count": {"field": "host.name"}},
                    "top_values": {"terms": {"field": "host.name", "size": 10}}
                }
            }},
            "size": 0
        }));
        assert_eq!(
            info.kind,
            SearchQueryKind::Facets {
                field: "host.name".to_string(),
                top_n: 10,
                sample_limit: 5000
            }
        );
    }

    #[test]
    fn test_facets_numeric_classification() {
        let ctx = StaticContext::new("logs").with_column("bytes", "Int64");
        let translator = QueryTranslator::new(&ctx, DateMathRenderer::ClickhouseInterval);
        let (_, info, _) = translator.parse_query_internal(&json!({
            "aggs": {"sample": {
                "sampler": {"shard_size": 5000},
                "aggs": {
                    "sample_count": {"value_count": {"field": "bytes"}},
                    "top_values": {"terms": {"field": "bytes", "size": 10}},
                    "min_value": {"min": {"field": "bytes"}},
                    "max_value": {"max": {"field": "bytes"}}
                }
            }},
            "size": 0
        }));
        assert!(matches!(info.kind, SearchQueryKind::FacetsNumeric { .. }));
    }

    #[test]
    fn test_classification_ignores_unrelated_metadata() {
        let ctx = ctx();
        let translator = QueryTranslator::new(&ctx, DateMathRenderer::ClickhouseInterval);
        let base = json!({"query": {"match_all": {}}, "size": 5});
        let (_, info_base, _) = translator.parse_query_internal(&base);
        let decorated = json!({
            "query": {"match_all": {}},
            "size": 5,
            "track_total_hits": true,
            "timeout": "3s",
            "version": true,
            "highlight": {"pre_tags": ["<b>"], "post_tags": ["</b>"]}
        });
        let (_, info_decorated, _) = translator.parse_query_internal(&decorated);
        assert_eq!(info_base.kind, info_decorated.kind);
    }

    #[test]
    fn test_list_classification_shapes() {
        let ctx = ctx();
        let translator = QueryTranslator::new(&ctx, DateMathRenderer::ClickhouseInterval);

        let (_, info, _) = translator.parse_query_internal(&json!({"size": 100}));
        assert_eq!(info.kind, SearchQueryKind::ListAllFields);

        let (_, info, _) = translator
            .parse_query_internal(&json!({"size": 100, "fields": [{"field": "message"}]}));
        assert_eq!(info.kind, SearchQueryKind::ListByField { field: "message".to_string() });

        let (_, info, _) = translator.parse_query_internal(
            &json!({"size": 100, "fields": [{"field": "message"}, {"field": "*"}]}),
        );
        assert_eq!(info.kind, SearchQueryKind::ListAllFields);

        let (_, info, _) = translator.parse_query_internal(&json!({"size": 0}));
        assert_eq!(info.kind, SearchQueryKind::Normal);
    }

    #[test]
    fn test_plan_includes_count_and_hits() {
        let ctx = ctx();
        let translator = QueryTranslator::new(&ctx, DateMathRenderer::ClickhouseInterval);
        let (queries, ok) =
            translator.parse_query(&json!({"query": {"term": {"host": "a"}}, "size": 3}));
        assert!(ok);
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].plan_kind, PlanKind::Count);
        assert_eq!(queries[1].plan_kind, PlanKind::Hits);
        assert_eq!(
            select_to_sql(&queries[1].select),
            r#"SELECT * FROM "logs" WHERE "host" = 'a' LIMIT 3"#
        );
    }

    #[test]
    fn test_track_total_hits_false_drops_count_query() {
        let ctx = ctx();
        let translator = QueryTranslator::new(&ctx, DateMathRenderer::ClickhouseInterval);
        let (queries, ok) = translator
            .parse_query(&json!({"query": {"match_all": {}}, "track_total_hits": false}));
        assert!(ok);
        assert!(queries.iter().all(|q| q.plan_kind != PlanKind::Count));
    }

    #[test]
    fn test_facets_plan_aliases_key_and_doc_count() {
        let ctx = StaticContext::new("logs").with_column("host", "String");
        let translator = QueryTranslator::new(&ctx, DateMathRenderer::ClickhouseInterval);
        let (queries, ok) = translator.parse_query(&json!({
            "aggs": {"sample": {
                "sampler": {"shard_size": 5000},
                "aggs": {
                    "sample_count": {"value_count": {"field": "host"}},
                    "top_values": {"terms": {"field": "host", "size": 10}}
                }
            }},
            "size": 0,
            "track_total_hits": false
        }));
        assert!(ok);
        let facets = queries.iter().find(|q| q.plan_kind == PlanKind::Facets).unwrap();
        assert_eq!(
            select_to_sql(&facets.select),
            r#"SELECT "host" AS "key", count(*) AS "doc_count" FROM (SELECT "host" FROM "logs" LIMIT 5000) GROUP BY "host" ORDER BY count(*) desc LIMIT 10"#
        );
    }

    #[test]
    fn test_alias_resolution_in_parsing() {
        let ctx = StaticContext::new("logs")
            .with_column("message", "String")
            .with_alias("msg", "message");
        assert_eq!(
            parse_where(&ctx, json!({"query": {"term": {"msg": "x"}}})),
            r#""message" = 'x'"#
        );
    }
}
