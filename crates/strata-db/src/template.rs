//! Mustache-style string templates rendered against a flat document.
//!
//! `{{ some.path }}` interpolates the value at a dotted path. The
//! pseudo-variables `TIMESTAMP` and `DATETIME` produce the current UTC time,
//! with optional call arguments: `{{ TIMESTAMP("+2days") }}`,
//! `{{ DATETIME("-1hours", "YYYY-MM-DD HH:mm") }}` (shifter first, format
//! second, default format `YYYY-MM-DD`).

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use strata_query::timeshift::{self, DATE_FORMAT};

fn var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(.+?)\s*\}\}").unwrap())
}

fn time_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^(?:TIMESTAMP|DATETIME)(?:\(\s*(?:"([^"]*)"|'([^']*)')?\s*(?:,\s*(?:"([^"]*)"|'([^']*)'))?\s*\))?$"#,
        )
        .unwrap()
    })
}

/// Render a template against a flat document.
///
/// Unknown variables render as the empty string.
pub fn render(source: &str, flat: &Map<String, Value>) -> String {
    var_re()
        .replace_all(source, |caps: &Captures<'_>| resolve(&caps[1], flat))
        .into_owned()
}

fn resolve(expr: &str, flat: &Map<String, Value>) -> String {
    if let Some(caps) = time_call_re().captures(expr) {
        let shifter = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or("");
        let format = caps
            .get(3)
            .or_else(|| caps.get(4))
            .map(|m| m.as_str())
            .unwrap_or(DATE_FORMAT);
        let mut now = timeshift::utc_now();
        if !shifter.is_empty() {
            now = timeshift::shift(now, shifter);
        }
        return timeshift::format_datetime(now, format);
    }

    match flat.get(expr) {
        Some(value) => display(value),
        None => String::new(),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
