use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn aql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Sort {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Sort {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Parse sort directives from any of the accepted shapes:
///
/// - a string: `"name:desc"` or `"name"` (ASC by default)
/// - a list of such strings
/// - a map of field to direction, where the direction is `"asc"`/`"desc"`
///   (any case) or `1`/`-1`
pub fn parse_sorts(spec: &Value) -> Vec<Sort> {
    match spec {
        Value::String(s) => parse_sort_str(s).into_iter().collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().and_then(parse_sort_str))
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(field, dir)| Sort {
                field: field.clone(),
                direction: parse_direction(dir),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_sort_str(s: &str) -> Option<Sort> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    match s.split_once(':') {
        Some((field, dir)) => Some(Sort {
            field: field.to_string(),
            direction: if dir.trim().eq_ignore_ascii_case("desc") {
                SortDirection::Desc
            } else {
                SortDirection::Asc
            },
        }),
        None => Some(Sort::asc(s)),
    }
}

fn parse_direction(dir: &Value) -> SortDirection {
    match dir {
        Value::String(s) if s.eq_ignore_ascii_case("desc") => SortDirection::Desc,
        Value::Number(n) if n.as_i64() == Some(-1) => SortDirection::Desc,
        _ => SortDirection::Asc,
    }
}
