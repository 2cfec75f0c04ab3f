use regex::{Captures, Regex, RegexBuilder};
use serde_json::Value;

use crate::timeshift::{self, DATE_FORMAT};

/// A macro expansion function: receives the regex captures of the matched
/// literal and produces the replacement value.
pub type MacroFn = fn(&Captures<'_>) -> Value;

struct Macro {
    name: &'static str,
    pattern: Regex,
    func: MacroFn,
}

/// Registry of literal macros expanded inside filter values before they are
/// baked into bind variables or matched in memory.
pub struct MacroRegistry {
    macros: Vec<Macro>,
}

impl MacroRegistry {
    /// An empty registry with no macros.
    pub fn empty() -> Self {
        MacroRegistry { macros: Vec::new() }
    }

    /// Register a macro. The pattern is matched case-insensitively against
    /// whole string values.
    pub fn register(&mut self, name: &'static str, pattern: &str, func: MacroFn) {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("macro pattern must be a valid regex");
        self.macros.push(Macro {
            name,
            pattern,
            func,
        });
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.macros.iter().map(|m| m.name).collect()
    }

    /// Expand macros in a value. String values are matched directly; the
    /// elements of an array are matched individually. Anything else passes
    /// through unchanged.
    pub fn eval(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.eval_str(s).unwrap_or_else(|| value.clone()),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => {
                            self.eval_str(s).unwrap_or_else(|| item.clone())
                        }
                        other => other.clone(),
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn eval_str(&self, s: &str) -> Option<Value> {
        for m in &self.macros {
            if let Some(caps) = m.pattern.captures(s) {
                return Some((m.func)(&caps));
            }
        }
        None
    }
}

impl Default for MacroRegistry {
    /// The built-in macro set: `NOW`.
    fn default() -> Self {
        let mut registry = MacroRegistry::empty();
        registry.register("NOW", r"^\[\[@MACRO:NOW\s*,?\s*(.*)\]\]$", macro_now);
        registry
    }
}

/// `[[@MACRO:NOW]]`, `[[@MACRO:NOW, <shifter>]]`,
/// `[[@MACRO:NOW, <shifter>, <format>]]` — the current UTC timestamp,
/// optionally shifted, formatted with arrow-style tokens (default
/// `YYYY-MM-DD`).
fn macro_now(caps: &Captures<'_>) -> Value {
    let arg = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
    let (shifter, format) = match arg.split_once(',') {
        Some((shifter, format)) => (shifter.trim(), format.trim()),
        None => (arg, ""),
    };

    let mut now = timeshift::utc_now();
    if !shifter.is_empty() {
        now = timeshift::shift(now, shifter);
    }
    let format = if format.is_empty() { DATE_FORMAT } else { format };
    Value::String(timeshift::format_datetime(now, format))
}
