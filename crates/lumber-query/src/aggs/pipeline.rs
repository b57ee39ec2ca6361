//! Pipeline aggregation shapers.
//!
//! Pipeline aggregations never hit the database: the runner feeds them the
//! postprocessed rows of their parent query and the math happens here.

use std::fmt;

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::plan::{JsonMap, QueryResultRow, ResponseShaper};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineKind {
    Derivative(usize),
    SerialDiff(usize),
    CumulativeSum,
    AvgBucket,
    BucketScript,
}

pub struct PipelineShaper {
    kind: PipelineKind,
    script: Option<String>,
}

impl PipelineShaper {
    pub fn new(kind: PipelineKind, spec: &Map<String, Value>) -> Self {
        let script = spec
            .get("script")
            .and_then(|s| s.as_str().map(|s| s.to_string()).or_else(|| {
                s.get("source").and_then(Value::as_str).map(|s| s.to_string())
            }));
        if matches!(kind, PipelineKind::BucketScript) && script.as_deref() != Some("count * 1") {
            warn!(?script, "bucket_script supports only the identity script, passing counts through");
        }
        Self { kind, script }
    }
}

impl fmt::Display for PipelineShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            PipelineKind::Derivative(_) => write!(f, "derivative"),
            PipelineKind::SerialDiff(lag) => write!(f, "serial_diff(lag: {})", lag),
            PipelineKind::CumulativeSum => write!(f, "cumulative_sum"),
            PipelineKind::AvgBucket => write!(f, "avg_bucket"),
            PipelineKind::BucketScript => {
                write!(f, "bucket_script({})", self.script.as_deref().unwrap_or(""))
            }
        }
    }
}

impl ResponseShaper for PipelineShaper {
    fn is_bucket_aggregation(&self) -> bool {
        false
    }

    fn rows_to_json(&self, rows: &[QueryResultRow], _level: usize) -> Vec<JsonMap> {
        if rows.is_empty() {
            warn!(shaper = %self, "no rows for pipeline aggregation");
            return vec![JsonMap::new()];
        }
        rows.iter()
            .map(|row| {
                let mut out = JsonMap::new();
                out.insert(
                    "value".to_string(),
                    row.last_cell_value().cloned().unwrap_or(Value::Null),
                );
                out
            })
            .collect()
    }

    fn postprocess_rows(&self, rows: Vec<QueryResultRow>) -> Vec<QueryResultRow> {
        match &self.kind {
            PipelineKind::Derivative(lag) | PipelineKind::SerialDiff(lag) => {
                difference_with_lag(rows, *lag)
            }
            PipelineKind::CumulativeSum => cumulative_sum(rows),
            PipelineKind::AvgBucket => avg_bucket(rows),
            PipelineKind::BucketScript => rows,
        }
    }
}

/// Values of a numeric series: floats and ints stay apart so integer series
/// come back as integers. The type is picked per first non-null bucket.
#[derive(Clone, Copy, PartialEq)]
enum SeriesKind {
    Float,
    Int,
}

fn series_kind(rows: &[QueryResultRow]) -> Option<SeriesKind> {
    for row in rows {
        match row.last_cell_value() {
            Some(Value::Number(n)) => {
                return Some(if n.is_i64() || n.is_u64() {
                    SeriesKind::Int
                } else {
                    SeriesKind::Float
                });
            }
            _ => continue,
        }
    }
    None
}

/// The first `lag` buckets get null values, every later bucket the difference
/// to the bucket `lag` places before it.
fn difference_with_lag(rows: Vec<QueryResultRow>, lag: usize) -> Vec<QueryResultRow> {
    let Some(kind) = series_kind(&rows) else {
        return rows.iter().map(|r| r.with_last_value(Value::Null)).collect();
    };

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            if i < lag {
                return row.with_last_value(Value::Null);
            }
            let current = row.last_cell_value();
            let previous = rows[i - lag].last_cell_value();
            let value = match kind {
                SeriesKind::Int => match (
                    current.and_then(Value::as_i64),
                    previous.and_then(Value::as_i64),
                ) {
                    (Some(c), Some(p)) => json!(c - p),
                    _ => Value::Null,
                },
                SeriesKind::Float => match (
                    current.and_then(Value::as_f64),
                    previous.and_then(Value::as_f64),
                ) {
                    (Some(c), Some(p)) => json!(c - p),
                    _ => Value::Null,
                },
            };
            row.with_last_value(value)
        })
        .collect()
}

fn cumulative_sum(rows: Vec<QueryResultRow>) -> Vec<QueryResultRow> {
    let Some(kind) = series_kind(&rows) else {
        return rows;
    };
    let mut sum_int: i64 = 0;
    let mut sum_float: f64 = 0.0;
    rows.iter()
        .map(|row| match kind {
            SeriesKind::Int => {
                if let Some(v) = row.last_cell_value().and_then(Value::as_i64) {
                    sum_int += v;
                }
                row.with_last_value(json!(sum_int))
            }
            SeriesKind::Float => {
                if let Some(v) = row.last_cell_value().and_then(Value::as_f64) {
                    sum_float += v;
                }
                row.with_last_value(json!(sum_float))
            }
        })
        .collect()
}

/// Collapses the parent series into one row carrying the average.
fn avg_bucket(rows: Vec<QueryResultRow>) -> Vec<QueryResultRow> {
    let values: Vec<f64> = rows
        .iter()
        .filter_map(|r| r.last_cell_value().and_then(Value::as_f64))
        .collect();
    let avg = if values.is_empty() {
        Value::Null
    } else {
        json!(values.iter().sum::<f64>() / values.len() as f64)
    };
    match rows.into_iter().next() {
        Some(first) => vec![first.with_last_value(avg)],
        None => Vec::new(),
    }
}
