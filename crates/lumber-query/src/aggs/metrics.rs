//! Metric aggregation shapers.

use std::fmt;

use serde_json::{json, Value};
use tracing::warn;

use crate::ast::{column, function, Expr};
use crate::plan::{JsonMap, QueryResultRow, ResponseShaper};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Avg,
    Sum,
    Min,
    Max,
    Cardinality,
    ValueCount,
}

impl MetricKind {
    /// The SELECT column for the metric. The `-OrNull` combinators keep
    /// empty groups from collapsing into zeros.
    pub fn projection(self, field: &str) -> Expr {
        match self {
            MetricKind::Avg => function("avgOrNull", vec![column(field)]),
            MetricKind::Sum => function("sumOrNull", vec![column(field)]),
            MetricKind::Min => function("minOrNull", vec![column(field)]),
            MetricKind::Max => function("maxOrNull", vec![column(field)]),
            MetricKind::Cardinality => function("uniq", vec![column(field)]),
            MetricKind::ValueCount => function("count", vec![column(field)]),
        }
    }

    fn name(self) -> &'static str {
        match self {
            MetricKind::Avg => "avg",
            MetricKind::Sum => "sum",
            MetricKind::Min => "min",
            MetricKind::Max => "max",
            MetricKind::Cardinality => "cardinality",
            MetricKind::ValueCount => "value_count",
        }
    }
}

/// Single-valued metrics: the value is the last cell of the row.
pub struct MetricShaper {
    pub kind: MetricKind,
}

impl fmt::Display for MetricShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.name())
    }
}

impl ResponseShaper for MetricShaper {
    fn is_bucket_aggregation(&self) -> bool {
        false
    }

    fn rows_to_json(&self, rows: &[QueryResultRow], _level: usize) -> Vec<JsonMap> {
        let value = match rows.first().and_then(|row| row.last_cell_value()) {
            Some(v) => v.clone(),
            None => {
                warn!(metric = self.kind.name(), "no rows returned for metric aggregation");
                Value::Null
            }
        };
        let mut out = JsonMap::new();
        out.insert("value".to_string(), value);
        vec![out]
    }
}

/// `stats`: count, min, max, avg, sum in the last five cells.
pub struct StatsShaper;

impl fmt::Display for StatsShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stats")
    }
}

impl ResponseShaper for StatsShaper {
    fn is_bucket_aggregation(&self) -> bool {
        false
    }

    fn rows_to_json(&self, rows: &[QueryResultRow], _level: usize) -> Vec<JsonMap> {
        let mut out = JsonMap::new();
        match rows.first() {
            Some(row) if row.cells.len() >= 5 => {
                let tail = &row.cells[row.cells.len() - 5..];
                for (name, cell) in ["count", "min", "max", "avg", "sum"].iter().zip(tail) {
                    out.insert(name.to_string(), cell.value.clone());
                }
            }
            _ => {
                warn!("no usable row for stats aggregation");
                for name in ["count", "min", "max", "avg", "sum"] {
                    out.insert(name.to_string(), Value::Null);
                }
            }
        }
        vec![out]
    }
}

/// `percentiles`: the last cell is the quantiles array, keyed back by the
/// requested percents.
pub struct PercentilesShaper {
    pub percents: Vec<f64>,
}

impl fmt::Display for PercentilesShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "percentiles: {:?}", self.percents)
    }
}

impl ResponseShaper for PercentilesShaper {
    fn is_bucket_aggregation(&self) -> bool {
        false
    }

    fn rows_to_json(&self, rows: &[QueryResultRow], _level: usize) -> Vec<JsonMap> {
        let mut values = JsonMap::new();
        let quantiles = rows
            .first()
            .and_then(|row| row.last_cell_value())
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for (i, percent) in self.percents.iter().enumerate() {
            values.insert(
                format!("{:.1}", percent),
                quantiles.get(i).cloned().unwrap_or(Value::Null),
            );
        }
        let mut out = JsonMap::new();
        out.insert("values".to_string(), Value::Object(values));
        vec![out]
    }
}

/// `top_hits` at the root of the tree: rows become hit sources.
pub struct TopHitsShaper {
    pub size: usize,
}

impl fmt::Display for TopHitsShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "top_hits(size: {})", self.size)
    }
}

impl ResponseShaper for TopHitsShaper {
    fn is_bucket_aggregation(&self) -> bool {
        false
    }

    fn rows_to_json(&self, rows: &[QueryResultRow], _level: usize) -> Vec<JsonMap> {
        let hits: Vec<Value> = rows
            .iter()
            .take(self.size)
            .map(|row| {
                let source: JsonMap = row
                    .cells
                    .iter()
                    .filter(|c| !c.value.is_null())
                    .map(|c| (c.name.clone(), c.value.clone()))
                    .collect();
                json!({ "_source": source, "_score": 1 })
            })
            .collect();
        let mut out = JsonMap::new();
        out.insert(
            "hits".to_string(),
            json!({
                "total": { "value": hits.len(), "relation": "eq" },
                "hits": hits,
            }),
        );
        vec![out]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_value_from_last_cell() {
        let rows = vec![QueryResultRow::new(vec![("key", json!("a")), ("sum", json!(42))])];
        let out = MetricShaper { kind: MetricKind::Sum }.rows_to_json(&rows, 1);
        assert_eq!(out[0]["value"], json!(42));
    }

    #[test]
    fn test_metric_without_rows_is_null() {
        let out = MetricShaper { kind: MetricKind::Avg }.rows_to_json(&[], 0);
        assert_eq!(out[0]["value"], Value::Null);
    }

    #[test]
    fn test_stats_maps_five_columns() {
        let rows = vec![QueryResultRow::new(vec![
            ("count", json!(10)),
            ("min", json!(1)),
            ("max", json!(9)),
            ("avg", json!(4.2)),
            ("sum", json!(42)),
        ])];
        let out = StatsShaper.rows_to_json(&rows, 0);
        assert_eq!(out[0]["count"], json!(10));
        assert_eq!(out[0]["sum"], json!(42));
    }

    #[test]
    fn test_percentiles_key_by_percent() {
        let rows = vec![QueryResultRow::new(vec![("q", json!([1.5, 9.9]))])];
        let out = PercentilesShaper { percents: vec![50.0, 99.0] }.rows_to_json(&rows, 0);
        assert_eq!(out[0]["values"]["50.0"], json!(1.5));
        assert_eq!(out[0]["values"]["99.0"], json!(9.9));
    }
}
