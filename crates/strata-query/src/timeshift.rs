use std::sync::OnceLock;

use chrono::{DateTime, Duration, Months, Utc};
use regex::Regex;

/// The persisted timestamp format: UTC, ISO-8601 with offset.
pub const ISO_FORMAT: &str = "YYYY-MM-DDTHH:mm:ssZZ";

/// Default format for macro and template timestamps.
pub const DATE_FORMAT: &str = "YYYY-MM-DD";

/// Current UTC time.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

fn shift_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([+-]?\d+)([A-Za-z]+)$").unwrap())
}

/// Shift a datetime by a human-readable expression.
///
/// The expression is whitespace-separated tokens of the form
/// `[+|-]<number><unit>`, unit one of years/months/weeks/days/hours/minutes/
/// seconds (case-insensitive, trailing `s` optional): `+2days`,
/// `-3hours 6minutes`, `1year 2months +3days`.
///
/// Unknown tokens are ignored; an expression with no valid token returns the
/// input unshifted.
pub fn shift(dt: DateTime<Utc>, stmt: &str) -> DateTime<Utc> {
    let mut out = dt;
    for token in stmt.split_whitespace() {
        let Some(caps) = shift_token_re().captures(token) else {
            continue;
        };
        let Ok(n) = caps[1].parse::<i64>() else {
            continue;
        };
        let unit = caps[2].to_lowercase();
        let unit = unit.strip_suffix('s').unwrap_or(&unit);
        out = match unit {
            "second" => out + Duration::seconds(n),
            "minute" => out + Duration::minutes(n),
            "hour" => out + Duration::hours(n),
            "day" => out + Duration::days(n),
            "week" => out + Duration::weeks(n),
            "month" => shift_months(out, n),
            "year" => shift_months(out, n * 12),
            _ => out,
        };
    }
    out
}

// Calendar-aware month arithmetic; clamps to the end of shorter months.
fn shift_months(dt: DateTime<Utc>, months: i64) -> DateTime<Utc> {
    let delta = Months::new(months.unsigned_abs() as u32);
    let shifted = if months >= 0 {
        dt.checked_add_months(delta)
    } else {
        dt.checked_sub_months(delta)
    };
    shifted.unwrap_or(dt)
}

/// Format a datetime with arrow-style tokens (`YYYY MM DD HH mm ss ZZ`).
pub fn format_datetime(dt: DateTime<Utc>, format: &str) -> String {
    const TOKENS: &[(&str, &str)] = &[
        ("YYYY", "%Y"),
        ("MM", "%m"),
        ("DD", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("ZZ", "%:z"),
    ];

    let mut strftime = String::with_capacity(format.len() * 2);
    let mut rest = format;
    'outer: while !rest.is_empty() {
        for (token, repl) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                strftime.push_str(repl);
                rest = tail;
                continue 'outer;
            }
        }
        let ch = rest.chars().next().unwrap();
        if ch == '%' {
            strftime.push_str("%%");
        } else {
            strftime.push(ch);
        }
        rest = &rest[ch.len_utf8()..];
    }

    dt.format(&strftime).to_string()
}

/// Format a datetime as the persisted ISO-8601 representation.
pub fn iso_datetime(dt: DateTime<Utc>) -> String {
    format_datetime(dt, ISO_FORMAT)
}
