//! In-memory query engine for embedded subcollections.
//!
//! Evaluates the same filter dialect the compiler emits, against an
//! in-process list of documents. Matching is leaf-by-leaf; logic groups are
//! honored; macros expand before matching.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::{Map, Value};

use strata_query::filter::{Condition, FilterClause, FilterOp, FilterSet, LogicOp};
use strata_query::macros::MacroRegistry;
use strata_query::{Sort, SortDirection, parse_filters};

use crate::error::DbError;
use crate::path;

/// Filter a list of documents. Returns every matching document, in input
/// order, without pagination.
pub fn query(data: &[Value], filters: &Map<String, Value>) -> Result<Vec<Value>, DbError> {
    let set = parse_filters(filters)?.evaluated(&MacroRegistry::default());
    Ok(data
        .iter()
        .filter(|doc| matches(doc, &set))
        .cloned()
        .collect())
}

/// Whether a document satisfies a parsed filter.
pub fn matches(doc: &Value, filters: &FilterSet) -> bool {
    filters.clauses.iter().all(|clause| match clause {
        FilterClause::Leaf(cond) => matches_condition(doc, cond),
        FilterClause::Group {
            logic,
            alternatives,
        } => alternatives
            .iter()
            .all(|alt| matches_alternative(doc, *logic, alt)),
    })
}

fn matches_alternative(doc: &Value, logic: LogicOp, conditions: &[Condition]) -> bool {
    match logic {
        LogicOp::And => conditions.iter().all(|c| matches_condition(doc, c)),
        LogicOp::Or => conditions.iter().any(|c| matches_condition(doc, c)),
        LogicOp::Not => !conditions.iter().all(|c| matches_condition(doc, c)),
        LogicOp::Nor => !conditions.iter().any(|c| matches_condition(doc, c)),
    }
}

fn matches_condition(doc: &Value, cond: &Condition) -> bool {
    let field = path::get(doc, &cond.path);
    match cond.op {
        FilterOp::Eq => field.is_some_and(|v| values_eq(v, &cond.value)),
        FilterOp::Ne => !field.is_some_and(|v| values_eq(v, &cond.value)),
        FilterOp::Gt => compare(field, &cond.value).is_some_and(|o| o == Ordering::Greater),
        FilterOp::Gte => compare(field, &cond.value).is_some_and(|o| o != Ordering::Less),
        FilterOp::Lt => compare(field, &cond.value).is_some_and(|o| o == Ordering::Less),
        FilterOp::Lte => compare(field, &cond.value).is_some_and(|o| o != Ordering::Greater),
        FilterOp::In => in_list(field, &cond.value),
        FilterOp::Xin => !in_list(field, &cond.value),
        FilterOp::Includes => includes(field, &cond.value),
        FilterOp::Xincludes => !includes(field, &cond.value),
        FilterOp::Like => like(field, &cond.value),
        FilterOp::Nlike => !like(field, &cond.value),
    }
}

fn values_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(field: Option<&Value>, target: &Value) -> Option<Ordering> {
    let field = field?;
    if let (Some(a), Some(b)) = (field.as_f64(), target.as_f64()) {
        return a.partial_cmp(&b);
    }
    match (field, target) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn in_list(field: Option<&Value>, target: &Value) -> bool {
    match (field, target) {
        (Some(v), Value::Array(items)) => items.iter().any(|item| values_eq(v, item)),
        _ => false,
    }
}

fn includes(field: Option<&Value>, target: &Value) -> bool {
    match field {
        Some(Value::Array(items)) => items.iter().any(|item| values_eq(item, target)),
        _ => false,
    }
}

fn like(field: Option<&Value>, target: &Value) -> bool {
    let (Some(Value::String(haystack)), Value::String(pattern)) = (field, target) else {
        return false;
    };
    like_pattern(pattern)
        .map(|re| re.is_match(haystack))
        .unwrap_or(false)
}

/// Translate a LIKE pattern (`%` any run, `_` any single char) into an
/// anchored regex.
fn like_pattern(pattern: &str) -> Option<Regex> {
    let mut re = String::with_capacity(pattern.len() + 2);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

/// A materialized result set: sorted, then offset, then limited.
///
/// Iteration yields the paginated documents; [`len`](Cursor::len) reports
/// the unpaginated match count.
pub struct Cursor {
    total: usize,
    inner: std::vec::IntoIter<Value>,
}

impl Cursor {
    pub fn new(mut items: Vec<Value>, sorts: &[Sort], offset: usize, limit: usize) -> Self {
        let total = items.len();
        if !sorts.is_empty() {
            sort_documents(&mut items, sorts);
        }
        let page: Vec<Value> = items.into_iter().skip(offset).take(limit).collect();
        Cursor {
            total,
            inner: page.into_iter(),
        }
    }

    /// The unpaginated match count.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

impl Iterator for Cursor {
    type Item = Value;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

fn sort_documents(items: &mut [Value], sorts: &[Sort]) {
    items.sort_by(|a, b| {
        for sort in sorts {
            let ord = compare_fields(path::get(a, &sort.field), path::get(b, &sort.field));
            let ord = match sort.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare(Some(a), b).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(v: Value) -> Vec<Value> {
        v.as_array().unwrap().clone()
    }

    fn filters(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn gte_sort_desc_and_length() {
        let data = docs(json!([{"a": 1}, {"a": 2}, {"a": 3}]));
        let matched = query(&data, &filters(json!({"a:$gte": 2}))).unwrap();
        let cursor = Cursor::new(matched, &[Sort::desc("a")], 0, 10);
        assert_eq!(cursor.len(), 2);
        let rows: Vec<Value> = cursor.collect();
        assert_eq!(rows, docs(json!([{"a": 3}, {"a": 2}])));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let data = docs(json!([{"a": 1}, {"b": 2}]));
        let matched = query(&data, &Map::new()).unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn eq_and_ne() {
        let data = docs(json!([
            {"status": "active"},
            {"status": "pending"},
            {"other": 1}
        ]));
        let matched = query(&data, &filters(json!({"status": "active"}))).unwrap();
        assert_eq!(matched.len(), 1);
        let matched = query(&data, &filters(json!({"status:$ne": "active"}))).unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn numeric_comparison_crosses_int_and_float() {
        let data = docs(json!([{"score": 1.5}, {"score": 2}]));
        let matched = query(&data, &filters(json!({"score:$gt": 1}))).unwrap();
        assert_eq!(matched.len(), 2);
        let matched = query(&data, &filters(json!({"score:$eq": 2.0}))).unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn dotted_paths_descend() {
        let data = docs(json!([
            {"profile": {"city": "Austin"}},
            {"profile": {"city": "Boston"}}
        ]));
        let matched = query(&data, &filters(json!({"profile.city": "Austin"}))).unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn in_and_xin() {
        let data = docs(json!([{"city": "a"}, {"city": "b"}, {"city": "c"}]));
        let matched = query(&data, &filters(json!({"city:$in": ["a", "b"]}))).unwrap();
        assert_eq!(matched.len(), 2);
        let matched = query(&data, &filters(json!({"city:$xin": ["a", "b"]}))).unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn includes_and_xincludes() {
        let data = docs(json!([
            {"tags": ["rust", "db"]},
            {"tags": ["python"]},
            {"tags": []}
        ]));
        let matched = query(&data, &filters(json!({"tags:$includes": "rust"}))).unwrap();
        assert_eq!(matched.len(), 1);
        let matched = query(&data, &filters(json!({"tags:$xincludes": "rust"}))).unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn like_and_nlike() {
        let data = docs(json!([
            {"email": "ada@host.org"},
            {"email": "grace@host.org"},
            {"email": "ada@else.net"}
        ]));
        let matched = query(&data, &filters(json!({"email:$like": "ada@%"}))).unwrap();
        assert_eq!(matched.len(), 2);
        let matched = query(&data, &filters(json!({"email:$like": "____e@host.org"}))).unwrap();
        assert_eq!(matched.len(), 1);
        let matched = query(&data, &filters(json!({"email:$nlike": "%host.org"}))).unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn or_group_matches_any_leaf() {
        let data = docs(json!([
            {"status": "active", "score": 1},
            {"status": "pending", "score": 99},
            {"status": "pending", "score": 1}
        ]));
        let matched = query(
            &data,
            &filters(json!({"$or": [{"status": "active", "score:$gt": 50}]})),
        )
        .unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn and_group_requires_all_leaves() {
        let data = docs(json!([
            {"status": "active", "score": 99},
            {"status": "active", "score": 1}
        ]));
        let matched = query(
            &data,
            &filters(json!({"$and": [{"status": "active", "score:$gt": 50}]})),
        )
        .unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn nor_group_rejects_any_match() {
        let data = docs(json!([
            {"status": "active"},
            {"status": "pending"},
            {"status": "archived"}
        ]));
        let matched = query(
            &data,
            &filters(json!({"$nor": [{"status": "active", "status:$eq": "pending"}]})),
        )
        .unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn multiple_top_level_clauses_conjoin() {
        let data = docs(json!([
            {"a": 1, "b": 1},
            {"a": 1, "b": 2},
            {"a": 2, "b": 1}
        ]));
        let matched = query(&data, &filters(json!({"a": 1, "b": 1}))).unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn invalid_logic_propagates() {
        let err = query(&[], &filters(json!({"$or": 42}))).unwrap_err();
        assert!(matches!(err, DbError::Query(_)), "{err:?}");
    }

    #[test]
    fn cursor_offset_and_limit() {
        let items = docs(json!([{"a": 1}, {"a": 2}, {"a": 3}, {"a": 4}]));
        let cursor = Cursor::new(items, &[Sort::asc("a")], 1, 2);
        assert_eq!(cursor.len(), 4);
        let rows: Vec<Value> = cursor.collect();
        assert_eq!(rows, docs(json!([{"a": 2}, {"a": 3}])));
    }

    #[test]
    fn cursor_multi_key_sort() {
        let items = docs(json!([
            {"g": "b", "n": 1},
            {"g": "a", "n": 2},
            {"g": "a", "n": 1}
        ]));
        let cursor = Cursor::new(items, &[Sort::asc("g"), Sort::desc("n")], 0, 10);
        let rows: Vec<Value> = cursor.collect();
        assert_eq!(
            rows,
            docs(json!([
                {"g": "a", "n": 2},
                {"g": "a", "n": 1},
                {"g": "b", "n": 1}
            ]))
        );
    }

    #[test]
    fn cursor_missing_sort_field_sorts_first() {
        let items = docs(json!([{"a": 2}, {"b": 1}, {"a": 1}]));
        let cursor = Cursor::new(items, &[Sort::asc("a")], 0, 10);
        let rows: Vec<Value> = cursor.collect();
        assert_eq!(rows[0], json!({"b": 1}));
    }
}
