//! Bucket aggregation shapers.

use std::fmt;

use chrono::DateTime;
use serde_json::{json, Value};
use tracing::error;

use crate::ast::{self, column, function, infix, Expr};
use crate::plan::{JsonMap, QueryResultRow, ResponseShaper};

/// Plain terms buckets: key plus doc_count.
pub struct TermsShaper;

impl fmt::Display for TermsShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "terms")
    }
}

impl ResponseShaper for TermsShaper {
    fn is_bucket_aggregation(&self) -> bool {
        true
    }

    fn rows_to_json(&self, rows: &[QueryResultRow], level: usize) -> Vec<JsonMap> {
        rows.iter()
            .map(|row| {
                let mut bucket = JsonMap::new();
                bucket.insert("key".to_string(), cell_value(row, level));
                bucket.insert("doc_count".to_string(), cell_value(row, level + 1));
                bucket
            })
            .collect()
    }
}

/// Numeric histogram buckets.
pub struct HistogramShaper;

impl fmt::Display for HistogramShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "histogram")
    }
}

impl ResponseShaper for HistogramShaper {
    fn is_bucket_aggregation(&self) -> bool {
        true
    }

    fn rows_to_json(&self, rows: &[QueryResultRow], level: usize) -> Vec<JsonMap> {
        rows.iter()
            .map(|row| {
                let mut bucket = JsonMap::new();
                bucket.insert("key".to_string(), cell_value(row, level));
                bucket.insert("doc_count".to_string(), cell_value(row, level + 1));
                bucket
            })
            .collect()
    }
}

/// Date histogram buckets; keys are epoch millis aligned to the interval.
pub struct DateHistogramShaper {
    pub interval_ms: i64,
}

impl fmt::Display for DateHistogramShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "date_histogram(interval: {}ms)", self.interval_ms)
    }
}

impl ResponseShaper for DateHistogramShaper {
    fn is_bucket_aggregation(&self) -> bool {
        true
    }

    fn rows_to_json(&self, rows: &[QueryResultRow], level: usize) -> Vec<JsonMap> {
        rows.iter()
            .map(|row| {
                let key = cell_value(row, level);
                let mut bucket = JsonMap::new();
                if let Some(millis) = key.as_i64() {
                    bucket.insert("key_as_string".to_string(), json!(format_millis(millis)));
                }
                bucket.insert("key".to_string(), key);
                bucket.insert("doc_count".to_string(), cell_value(row, level + 1));
                bucket
            })
            .collect()
    }
}

/// One date interval of a `date_range` aggregation. Bounds are SQL snippets
/// in the database's own vocabulary (e.g. `toStartOfDay(subDate(now(),
/// INTERVAL 3 week))`) or `*` for an unbounded end.
#[derive(Debug, Clone, PartialEq)]
pub struct DateTimeInterval {
    pub begin: String,
    pub end: String,
}

impl DateTimeInterval {
    pub const UNBOUNDED: &'static str = "*";

    /// `count(if(<interval condition>,1,NULL))`, one SELECT column per
    /// interval. The from value is included, the to value excluded.
    pub fn count_column(&self, field: &str) -> Expr {
        let begin = (self.begin != Self::UNBOUNDED)
            .then(|| infix(column(field), ">=", ast::literal(self.begin.clone())));
        let end = (self.end != Self::UNBOUNDED)
            .then(|| infix(column(field), "<", ast::literal(self.end.clone())));
        let cond = match (begin, end) {
            (Some(b), Some(e)) => Some(ast::and(vec![b, e]).expect("two clauses")),
            (Some(b), None) => Some(b),
            (None, Some(e)) => Some(e),
            (None, None) => None,
        };
        match cond {
            Some(cond) => function(
                "count",
                vec![function("if", vec![cond, ast::literal("1"), ast::literal("NULL")])],
            ),
            None => ast::count_star(),
        }
    }

    /// The bound timestamps are computed by the database too; one extra
    /// SELECT column per bounded endpoint.
    pub fn begin_timestamp_column(&self) -> Option<Expr> {
        (self.begin != Self::UNBOUNDED).then(|| {
            function(
                "toInt64",
                vec![function("toUnixTimestamp", vec![ast::literal(self.begin.clone())])],
            )
        })
    }

    pub fn end_timestamp_column(&self) -> Option<Expr> {
        (self.end != Self::UNBOUNDED).then(|| {
            function(
                "toInt64",
                vec![function("toUnixTimestamp", vec![ast::literal(self.end.clone())])],
            )
        })
    }
}

/// Shaper for `date_range`: a single row carrying one count column per
/// interval, then the bounded endpoints' unix timestamps in interval order.
pub struct DateRangeShaper {
    pub intervals: Vec<DateTimeInterval>,
}

impl fmt::Display for DateRangeShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "date_range, intervals: {:?}", self.intervals)
    }
}

impl ResponseShaper for DateRangeShaper {
    fn is_bucket_aggregation(&self) -> bool {
        true
    }

    fn rows_to_json(&self, rows: &[QueryResultRow], level: usize) -> Vec<JsonMap> {
        if rows.len() != 1 {
            error!(rows = rows.len(), "unexpected number of rows in date_range response");
            return Vec::new();
        }
        let row = &rows[0];
        let mut ts_index = level + self.intervals.len();

        let mut buckets = Vec::with_capacity(self.intervals.len());
        for (i, interval) in self.intervals.iter().enumerate() {
            let mut bucket = JsonMap::new();
            bucket.insert("doc_count".to_string(), cell_value(row, level + i));

            let from_string = if interval.begin == DateTimeInterval::UNBOUNDED {
                DateTimeInterval::UNBOUNDED.to_string()
            } else {
                let seconds = cell_value(row, ts_index).as_i64().unwrap_or(0);
                ts_index += 1;
                bucket.insert("from".to_string(), json!(seconds * 1000));
                let formatted = format_seconds(seconds);
                bucket.insert("from_as_string".to_string(), json!(formatted.clone()));
                formatted
            };
            let to_string = if interval.end == DateTimeInterval::UNBOUNDED {
                DateTimeInterval::UNBOUNDED.to_string()
            } else {
                let seconds = cell_value(row, ts_index).as_i64().unwrap_or(0);
                ts_index += 1;
                bucket.insert("to".to_string(), json!(seconds * 1000));
                let formatted = format_seconds(seconds);
                bucket.insert("to_as_string".to_string(), json!(formatted.clone()));
                formatted
            };
            bucket.insert("key".to_string(), json!(format!("{}-{}", from_string, to_string)));
            buckets.push(bucket);
        }
        buckets
    }
}

/// One numeric interval of a `range` aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericRange {
    pub from: Option<f64>,
    pub to: Option<f64>,
    pub key: Option<String>,
}

impl NumericRange {
    pub fn count_column(&self, field: &str) -> Expr {
        let begin =
            self.from.map(|f| infix(column(field), ">=", ast::literal(format_number(f))));
        let end = self.to.map(|t| infix(column(field), "<", ast::literal(format_number(t))));
        let cond = match (begin, end) {
            (Some(b), Some(e)) => Some(ast::and(vec![b, e]).expect("two clauses")),
            (Some(b), None) => Some(b),
            (None, Some(e)) => Some(e),
            (None, None) => None,
        };
        match cond {
            Some(cond) => function(
                "count",
                vec![function("if", vec![cond, ast::literal("1"), ast::literal("NULL")])],
            ),
            None => ast::count_star(),
        }
    }

    fn bucket_key(&self) -> String {
        if let Some(key) = &self.key {
            return key.clone();
        }
        let from = self.from.map(format_number).unwrap_or_else(|| "*".to_string());
        let to = self.to.map(format_number).unwrap_or_else(|| "*".to_string());
        format!("{}-{}", from, to)
    }
}

/// Shaper for `range`: a single row with one count column per interval.
pub struct RangeShaper {
    pub ranges: Vec<NumericRange>,
}

impl fmt::Display for RangeShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "range, intervals: {:?}", self.ranges)
    }
}

impl ResponseShaper for RangeShaper {
    fn is_bucket_aggregation(&self) -> bool {
        true
    }

    fn rows_to_json(&self, rows: &[QueryResultRow], level: usize) -> Vec<JsonMap> {
        if rows.len() != 1 {
            error!(rows = rows.len(), "unexpected number of rows in range response");
            return Vec::new();
        }
        let row = &rows[0];
        self.ranges
            .iter()
            .enumerate()
            .map(|(i, range)| {
                let mut bucket = JsonMap::new();
                bucket.insert("key".to_string(), json!(range.bucket_key()));
                if let Some(from) = range.from {
                    bucket.insert("from".to_string(), json!(from));
                }
                if let Some(to) = range.to {
                    bucket.insert("to".to_string(), json!(to));
                }
                bucket.insert("doc_count".to_string(), cell_value(row, level + i));
                bucket
            })
            .collect()
    }
}

/// Shaper for `filters`: a single row with one count column per named filter.
/// Unlike the list-shaped buckets, the response keys buckets by filter name.
pub struct FiltersShaper {
    pub names: Vec<String>,
}

impl fmt::Display for FiltersShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "filters: {:?}", self.names)
    }
}

impl ResponseShaper for FiltersShaper {
    fn is_bucket_aggregation(&self) -> bool {
        true
    }

    fn rows_to_json(&self, rows: &[QueryResultRow], level: usize) -> Vec<JsonMap> {
        let Some(row) = rows.first() else {
            return Vec::new();
        };
        let mut keyed = JsonMap::new();
        for (i, name) in self.names.iter().enumerate() {
            keyed.insert(name.clone(), json!({ "doc_count": cell_value(row, level + i) }));
        }
        vec![keyed]
    }

    fn to_fragment(&self, rows: &[QueryResultRow], level: usize) -> Value {
        let keyed = self.rows_to_json(rows, level).into_iter().next().unwrap_or_default();
        json!({ "buckets": keyed })
    }
}

fn cell_value(row: &QueryResultRow, index: usize) -> Value {
    row.cells.get(index).map(|c| c.value.clone()).unwrap_or(Value::Null)
}

fn format_millis(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S.%3fZ").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn format_seconds(seconds: i64) -> String {
    DateTime::from_timestamp(seconds, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S.%3f").to_string())
        .unwrap_or_else(|| seconds.to_string())
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}
