use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::QueryError;

/// Default iteration variable for the outermost query level.
pub const DEFAULT_ALIAS: &str = "root__";

/// Default result limit when the tree does not set one.
pub const DEFAULT_LIMIT: u64 = 10;

/// A declarative, nestable query tree.
///
/// Recognized keys are uppercase; lowercase spellings are accepted on
/// deserialization. Unset keys fall back to their documented defaults during
/// compilation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Xql {
    #[serde(rename = "FROM", alias = "from", default)]
    pub from: String,

    /// Iteration variable; defaults to [`DEFAULT_ALIAS`].
    #[serde(rename = "ALIAS", alias = "alias", default)]
    pub alias: Option<String>,

    #[serde(rename = "FILTERS", alias = "filters", default)]
    pub filters: Map<String, Value>,

    /// Ordering directives: a string, a list of `"path:dir"` strings, or a
    /// map of path to direction.
    #[serde(rename = "SORT", alias = "sort", default)]
    pub sort: Option<Value>,

    #[serde(rename = "LIMIT", alias = "limit", default)]
    pub limit: Option<u64>,

    /// Skip count; derived from PAGE and LIMIT when unset.
    #[serde(rename = "OFFSET", alias = "offset", default)]
    pub offset: Option<u64>,

    /// 1-based page number.
    #[serde(rename = "PAGE", alias = "page", default)]
    pub page: Option<u64>,

    /// Nested sub-queries, compiled as LET bindings in order.
    #[serde(rename = "JOIN", alias = "join", default)]
    pub join: Vec<Xql>,

    /// Collect-into-count alias (`COLLECT WITH COUNT INTO <name>`).
    #[serde(rename = "COUNT_AS", alias = "count_as", default)]
    pub count_as: Option<String>,

    /// Return expression; defaults to the alias.
    #[serde(rename = "RETURN", alias = "return", default)]
    pub return_expr: Option<String>,
}

impl Xql {
    pub fn new(from: impl Into<String>) -> Self {
        Xql {
            from: from.into(),
            ..Default::default()
        }
    }

    /// Decode a JSON tree (e.g. a request body) into a query.
    pub fn from_value(value: Value) -> Result<Self, QueryError> {
        Ok(serde_json::from_value(value)?)
    }

    /// The effective iteration variable.
    pub fn alias(&self) -> &str {
        self.alias.as_deref().filter(|a| !a.is_empty()).unwrap_or(DEFAULT_ALIAS)
    }

    /// The effective return expression.
    pub fn return_expr(&self) -> &str {
        self.return_expr
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.alias())
    }
}

/// Resolved pagination for one query level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub limit: u64,
    pub offset: u64,
    pub page: u64,
}

/// Resolve `(LIMIT, OFFSET, PAGE)` for a query level.
///
/// LIMIT defaults to [`DEFAULT_LIMIT`] and is clamped to `max_limit`. When
/// OFFSET is unset it is derived as `(PAGE - 1) * LIMIT` (a page below 1
/// counts as page 1).
pub fn resolve_paging(xql: &Xql, max_limit: u64) -> Paging {
    let mut limit = match xql.limit {
        Some(0) | None => DEFAULT_LIMIT,
        Some(n) => n,
    };
    let page = match xql.page {
        Some(0) | None => 1,
        Some(n) => n,
    };
    limit = limit.min(max_limit);
    let offset = xql.offset.unwrap_or_else(|| (page - 1) * limit);
    Paging {
        limit,
        offset,
        page,
    }
}
