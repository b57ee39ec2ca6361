//! Date-math expressions (`now-1d/d`) used in range queries.
//!
//! An expression is an anchor (`now`), a list of `+`/`-` offsets with a unit,
//! and an optional `/unit` rounding suffix. Rendering is pluggable: the
//! gateway computes at the database (`subDate(now(), INTERVAL ...)`), tests
//! pin a literal anchor for deterministic SQL.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateMathUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl DateMathUnit {
    fn from_char(c: char) -> Option<Self> {
        match c {
            's' => Some(Self::Second),
            'm' => Some(Self::Minute),
            'h' | 'H' => Some(Self::Hour),
            'd' => Some(Self::Day),
            'w' => Some(Self::Week),
            'M' => Some(Self::Month),
            'y' => Some(Self::Year),
            _ => None,
        }
    }

    fn interval_name(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    fn round_function(self) -> &'static str {
        match self {
            Self::Second => "toStartOfSecond",
            Self::Minute => "toStartOfMinute",
            Self::Hour => "toStartOfHour",
            Self::Day => "toStartOfDay",
            Self::Week => "toStartOfWeek",
            Self::Month => "toStartOfMonth",
            Self::Year => "toStartOfYear",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateMathOffset {
    pub amount: i64,
    pub unit: DateMathUnit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DateMathExpression {
    pub offsets: Vec<DateMathOffset>,
    pub rounding: Option<DateMathUnit>,
}

/// Parses `now`, `now-1d`, `now-1d/d`, `now+3h-30m`, ... Returns `None` for
/// anything that is not a date-math expression.
pub fn parse(input: &str) -> Option<DateMathExpression> {
    let rest = input.trim().strip_prefix("now")?;
    let mut offsets = Vec::new();
    let mut rounding = None;
    let mut chars = rest.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '+' | '-' => {
                chars.next();
                let sign: i64 = if c == '-' { -1 } else { 1 };
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if digits.is_empty() {
                    return None;
                }
                let unit = DateMathUnit::from_char(chars.next()?)?;
                let amount: i64 = digits.parse().ok()?;
                offsets.push(DateMathOffset { amount: sign * amount, unit });
            }
            '/' => {
                chars.next();
                rounding = Some(DateMathUnit::from_char(chars.next()?)?);
                if chars.next().is_some() {
                    return None;
                }
            }
            _ => return None,
        }
    }

    Some(DateMathExpression { offsets, rounding })
}

/// How a parsed expression becomes SQL.
#[derive(Debug, Clone)]
pub enum DateMathRenderer {
    /// `subDate(now(), INTERVAL n unit)`, rounding via `toStartOf*`.
    /// Accurate: the database evaluates `now()` at execution time.
    ClickhouseInterval,
    /// A fixed anchor resolved in-process to a quoted timestamp literal.
    /// Deterministic: used by tests.
    Literal { anchor: DateTime<Utc> },
}

impl DateMathRenderer {
    pub fn render(&self, expr: &DateMathExpression) -> String {
        match self {
            DateMathRenderer::ClickhouseInterval => {
                let mut sql = "now()".to_string();
                for offset in &expr.offsets {
                    let f = if offset.amount < 0 { "subDate" } else { "addDate" };
                    sql = format!(
                        "{}({}, INTERVAL {} {})",
                        f,
                        sql,
                        offset.amount.abs(),
                        offset.unit.interval_name()
                    );
                }
                if let Some(unit) = expr.rounding {
                    sql = format!("{}({})", unit.round_function(), sql);
                }
                sql
            }
            DateMathRenderer::Literal { anchor } => {
                let mut at = *anchor;
                for offset in &expr.offsets {
                    at = apply_offset(at, offset);
                }
                if let Some(unit) = expr.rounding {
                    at = round_down(at, unit);
                }
                format!("'{}'", at.format("%Y-%m-%dT%H:%M:%S%.3fZ"))
            }
        }
    }
}

fn apply_offset(at: DateTime<Utc>, offset: &DateMathOffset) -> DateTime<Utc> {
    match offset.unit {
        DateMathUnit::Second => at + Duration::seconds(offset.amount),
        DateMathUnit::Minute => at + Duration::minutes(offset.amount),
        DateMathUnit::Hour => at + Duration::hours(offset.amount),
        DateMathUnit::Day => at + Duration::days(offset.amount),
        DateMathUnit::Week => at + Duration::weeks(offset.amount),
        DateMathUnit::Month => shift_months(at, offset.amount),
        DateMathUnit::Year => shift_months(at, offset.amount * 12),
    }
}

fn shift_months(at: DateTime<Utc>, months: i64) -> DateTime<Utc> {
    let total = at.year() as i64 * 12 + at.month0() as i64 + months;
    let year = total.div_euclid(12) as i32;
    let month0 = total.rem_euclid(12) as u32;
    let day = at.day().min(days_in_month(year, month0 + 1));
    match at.with_year(year).and_then(|d| d.with_day(1)).and_then(|d| d.with_month0(month0)).and_then(|d| d.with_day(day)) {
        Some(shifted) => shifted,
        None => {
            warn!(year, month0, day, "month shift produced an invalid date, keeping original");
            at
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
        _ => 30,
    }
}

fn round_down(at: DateTime<Utc>, unit: DateMathUnit) -> DateTime<Utc> {
    let zeroed = at
        .with_nanosecond(0)
        .unwrap_or(at);
    match unit {
        DateMathUnit::Second => zeroed,
        DateMathUnit::Minute => zeroed.with_second(0).unwrap_or(zeroed),
        DateMathUnit::Hour => {
            zeroed.with_second(0).and_then(|d| d.with_minute(0)).unwrap_or(zeroed)
        }
        DateMathUnit::Day => zeroed
            .with_second(0)
            .and_then(|d| d.with_minute(0))
            .and_then(|d| d.with_hour(0))
            .unwrap_or(zeroed),
        DateMathUnit::Week => {
            let day_start = round_down(at, DateMathUnit::Day);
            let weekday = day_start.weekday().num_days_from_monday() as i64;
            day_start - Duration::days(weekday)
        }
        DateMathUnit::Month => {
            let day_start = round_down(at, DateMathUnit::Day);
            day_start.with_day(1).unwrap_or(day_start)
        }
        DateMathUnit::Year => {
            let day_start = round_down(at, DateMathUnit::Day);
            day_start.with_day(1).and_then(|d| d.with_month(1)).unwrap_or(day_start)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn anchor() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 9, 13, 47, 16).unwrap()
    }

    #[test]
    fn test_parse_plain_now() {
        let expr = parse("now").unwrap();
        assert!(expr.offsets.is_empty());
        assert!(expr.rounding.is_none());
    }

    #[test]
    fn test_parse_offset_and_rounding() {
        let expr = parse("now-1d/d").unwrap();
        assert_eq!(expr.offsets, vec![DateMathOffset { amount: -1, unit: DateMathUnit::Day }]);
        assert_eq!(expr.rounding, Some(DateMathUnit::Day));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("yesterday").is_none());
        assert!(parse("now-d").is_none());
        assert!(parse("now-1x").is_none());
        assert!(parse("now/d/d").is_none());
        assert!(parse("2024-02-02").is_none());
    }

    #[test]
    fn test_clickhouse_renderer_nests_interval_calls() {
        let expr = parse("now-3w/d").unwrap();
        let sql = DateMathRenderer::ClickhouseInterval.render(&expr);
        assert_eq!(sql, "toStartOfDay(subDate(now(), INTERVAL 3 week))");
    }

    #[test]
    fn test_literal_renderer_is_deterministic() {
        let expr = parse("now-1d/d").unwrap();
        let sql = DateMathRenderer::Literal { anchor: anchor() }.render(&expr);
        assert_eq!(sql, "'2024-02-08T00:00:00.000Z'");
    }

    #[test]
    fn test_literal_renderer_month_shift_clamps_day() {
        let expr = parse("now-1M").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();
        let sql = DateMathRenderer::Literal { anchor: at }.render(&expr);
        assert_eq!(sql, "'2024-02-29T00:00:00.000Z'");
    }
}
