//! Temporal expression extraction and normalization.
//!
//! Resolves relative expressions ("yesterday", "昨天") against an
//! anchor time and recognizes ISO datetimes, date literals, simple
//! date ranges, and duration phrases. Everything emitted is canonical:
//! ISO 8601 dates and whole seconds.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;

use super::quantity::parse_number_token;

/// Precision of a recognized time expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePrecision {
    /// Exact datetime.
    DateTime,
    /// Calendar day.
    Day,
    /// Vague ("that evening", "一会儿") — no canonical value.
    Fuzzy,
}

impl TimePrecision {
    /// Canonical string form stored in entity attributes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DateTime => "datetime",
            Self::Day => "day",
            Self::Fuzzy => "fuzzy",
        }
    }
}

/// One recognized temporal constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalConstraint {
    /// Canonical ISO 8601 start (date or datetime).
    pub start: String,
    /// Canonical end for ranges; equals `start` for points.
    pub end: Option<String>,
    /// Recognized precision.
    pub precision: TimePrecision,
    /// Pattern family that matched, for observability.
    pub source: &'static str,
    /// Recognition confidence.
    pub confidence: f64,
}

struct TemporalPatterns {
    iso_datetime: Regex,
    date_literal: Regex,
    date_range: Regex,
    en_written_date: Regex,
    duration: Regex,
    zh_duration: Regex,
}

fn patterns() -> &'static TemporalPatterns {
    static PATTERNS: OnceLock<TemporalPatterns> = OnceLock::new();
    PATTERNS.get_or_init(compile_patterns)
}

#[allow(clippy::unwrap_used)] // pattern literals are compile-time constants
fn compile_patterns() -> TemporalPatterns {
    TemporalPatterns {
        iso_datetime: Regex::new(
            r"(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?)",
        )
        .unwrap(),
        date_literal: Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap(),
        date_range: Regex::new(
            r"\b(\d{4}-\d{2}-\d{2})\s*(?:to|until|~|—|到|至)\s*(\d{4}-\d{2}-\d{2})\b",
        )
        .unwrap(),
        en_written_date: Regex::new(r"\b(\d{1,2})\s+([A-Za-z]+)\s+(\d{4})\b").unwrap(),
        duration: Regex::new(&format!(
            r"(?i)\b({})\s+(hours?|hrs?|minutes?|mins?|seconds?|secs?|days?)\b",
            super::quantity::num_pattern()
        ))
        .unwrap(),
        zh_duration: Regex::new(
            r"([\d.]+|[零〇一二两三四五六七八九十百千万]+)\s*(?:个)?\s*(小时|分钟|秒钟?|天)",
        )
        .unwrap(),
    }
}

/// Extract temporal constraints from text against an anchor time.
///
/// Recognition order mirrors specificity: explicit ranges, ISO
/// datetimes, date literals, written dates, then relative expressions.
/// Fuzzy words yield nothing canonical and are ignored here.
pub fn extract_constraints(text: &str, anchor: DateTime<Utc>) -> Vec<TemporalConstraint> {
    let mut out = Vec::new();
    let p = patterns();

    if let Some(c) = p.date_range.captures(text) {
        out.push(TemporalConstraint {
            start: c[1].to_owned(),
            end: Some(c[2].to_owned()),
            precision: TimePrecision::Day,
            source: "date_range",
            confidence: 0.95,
        });
        return out;
    }

    if let Some(c) = p.iso_datetime.captures(text) {
        out.push(TemporalConstraint {
            start: c[1].to_owned(),
            end: None,
            precision: TimePrecision::DateTime,
            source: "iso_datetime",
            confidence: 1.0,
        });
        return out;
    }

    if let Some(c) = p.date_literal.captures(text) {
        out.push(TemporalConstraint {
            start: format!("{}-{}-{}", &c[1], &c[2], &c[3]),
            end: None,
            precision: TimePrecision::Day,
            source: "date_literal",
            confidence: 0.95,
        });
        return out;
    }

    if let Some(c) = p.en_written_date.captures(text) {
        if let Some(date) = written_date(&c[1], &c[2], &c[3]) {
            out.push(TemporalConstraint {
                start: date.format("%Y-%m-%d").to_string(),
                end: None,
                precision: TimePrecision::Day,
                source: "written_date",
                confidence: 0.95,
            });
            return out;
        }
    }

    if let Some((date, source)) = relative_date(text, anchor) {
        out.push(TemporalConstraint {
            start: date.format("%Y-%m-%d").to_string(),
            end: None,
            precision: TimePrecision::Day,
            source,
            confidence: 0.9,
        });
    }

    out
}

/// Resolve a relative date word against the anchor.
fn relative_date(text: &str, anchor: DateTime<Utc>) -> Option<(NaiveDate, &'static str)> {
    let lower = text.to_lowercase();
    let day = |offset: i64| anchor.date_naive().checked_add_signed(Duration::days(offset));
    if lower.contains("yesterday") || text.contains("昨天") {
        return day(-1).map(|d| (d, "relative:yesterday"));
    }
    if lower.contains("today") || text.contains("今天") {
        return day(0).map(|d| (d, "relative:today"));
    }
    if lower.contains("tomorrow") || text.contains("明天") {
        return day(1).map(|d| (d, "relative:tomorrow"));
    }
    if lower.contains("last week") || text.contains("上周") {
        return day(-7).map(|d| (d, "relative:last_week"));
    }
    if lower.contains("last month") || text.contains("上个月") {
        return day(-30).map(|d| (d, "relative:last_month"));
    }
    if lower.contains("last year") || text.contains("去年") {
        return day(-365).map(|d| (d, "relative:last_year"));
    }
    None
}

fn written_date(day: &str, month: &str, year: &str) -> Option<NaiveDate> {
    const MONTHS: [(&str, u32); 12] = [
        ("jan", 1),
        ("feb", 2),
        ("mar", 3),
        ("apr", 4),
        ("may", 5),
        ("jun", 6),
        ("jul", 7),
        ("aug", 8),
        ("sep", 9),
        ("oct", 10),
        ("nov", 11),
        ("dec", 12),
    ];
    let m = month.to_lowercase();
    let month = MONTHS
        .iter()
        .find(|(prefix, _)| m.starts_with(prefix))
        .map(|(_, n)| *n)?;
    NaiveDate::from_ymd_opt(year.parse().ok()?, month, day.parse().ok()?)
}

/// Parse the first duration phrase in the text into whole seconds.
///
/// Handles digits, English number words ("two hours"), and Chinese
/// numerals ("两个小时", "三天").
pub fn parse_duration_seconds(text: &str) -> Option<u64> {
    let p = patterns();

    if let Some(c) = p.zh_duration.captures(text) {
        let value = parse_number_token(&c[1])?;
        let unit = &c[2];
        let seconds = match unit {
            "小时" => value * 3600.0,
            "分钟" => value * 60.0,
            "天" => value * 86_400.0,
            _ => value,
        };
        return to_seconds(seconds);
    }

    if let Some(c) = p.duration.captures(text) {
        let value = parse_number_token(&c[1])?;
        let unit = c[2].to_lowercase();
        let seconds = if unit.starts_with("hour") || unit.starts_with("hr") {
            value * 3600.0
        } else if unit.starts_with("min") {
            value * 60.0
        } else if unit.starts_with("day") {
            value * 86_400.0
        } else {
            value
        };
        return to_seconds(seconds);
    }

    None
}

fn to_seconds(value: f64) -> Option<u64> {
    if !value.is_finite() || value <= 0.0 || value > 1.0e15 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    // bounds checked above
    let seconds = value.round() as u64;
    Some(seconds)
}
