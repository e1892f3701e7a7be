//! Tests for `src/extract/temporal.rs` — canonical dates and
//! durations.

use chrono::{TimeZone, Utc};

use kindred::extract::temporal::{extract_constraints, parse_duration_seconds, TimePrecision};

fn anchor() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).single().expect("valid anchor")
}

#[test]
fn relative_dates_resolve_against_the_anchor() {
    let constraints = extract_constraints("我昨天去了公园", anchor());
    assert_eq!(constraints.len(), 1);
    assert_eq!(constraints[0].start, "2026-07-31");
    assert_eq!(constraints[0].precision, TimePrecision::Day);

    let constraints = extract_constraints("see you tomorrow", anchor());
    assert_eq!(constraints[0].start, "2026-08-02");

    let constraints = extract_constraints("我们上周见过面", anchor());
    assert_eq!(constraints[0].start, "2026-07-25");
}

#[test]
fn explicit_dates_win_over_relative_words() {
    let constraints = extract_constraints("it happened on 2025-12-24, not yesterday", anchor());
    assert_eq!(constraints.len(), 1);
    assert_eq!(constraints[0].start, "2025-12-24");
}

#[test]
fn iso_datetimes_are_recognized() {
    let constraints = extract_constraints("logged at 2026-03-05T09:30:00Z", anchor());
    assert_eq!(constraints[0].start, "2026-03-05T09:30:00Z");
    assert_eq!(constraints[0].precision, TimePrecision::DateTime);
}

#[test]
fn date_ranges_become_intervals() {
    let constraints = extract_constraints("旅行时间 2026-05-01 到 2026-05-07", anchor());
    assert_eq!(constraints.len(), 1);
    assert_eq!(constraints[0].start, "2026-05-01");
    assert_eq!(constraints[0].end.as_deref(), Some("2026-05-07"));
}

#[test]
fn written_english_dates_parse() {
    let constraints = extract_constraints("we met on 12 March 2025", anchor());
    assert_eq!(constraints[0].start, "2025-03-12");
}

#[test]
fn plain_text_yields_nothing() {
    assert!(extract_constraints("我喜欢茶", anchor()).is_empty());
}

#[test]
fn durations_normalize_to_seconds() {
    assert_eq!(parse_duration_seconds("跑了两个小时"), Some(7200));
    assert_eq!(parse_duration_seconds("等了45分钟"), Some(2700));
    assert_eq!(parse_duration_seconds("持续三天"), Some(259_200));
    assert_eq!(parse_duration_seconds("the flight took 2 hours"), Some(7200));
    assert_eq!(parse_duration_seconds("waited forty five minutes"), Some(2700));
    assert_eq!(parse_duration_seconds("nothing temporal here"), None);
}
