use serde_json::{Map, Value};

use crate::error::QueryError;
use crate::macros::MacroRegistry;

/// Comparison operator of a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Left-hand value in right-hand array: `alias.path IN [values]`.
    In,
    /// Left-hand value not in right-hand array.
    Xin,
    /// Right-hand value in left-hand array: `value IN alias.path`.
    Includes,
    /// Right-hand value not in left-hand array.
    Xincludes,
    Like,
    Nlike,
}

impl FilterOp {
    pub fn parse(op: &str) -> Option<FilterOp> {
        match op.to_uppercase().as_str() {
            "$EQ" => Some(FilterOp::Eq),
            "$NE" => Some(FilterOp::Ne),
            "$GT" => Some(FilterOp::Gt),
            "$GTE" => Some(FilterOp::Gte),
            "$LT" => Some(FilterOp::Lt),
            "$LTE" => Some(FilterOp::Lte),
            "$IN" => Some(FilterOp::In),
            "$XIN" => Some(FilterOp::Xin),
            "$INCLUDES" => Some(FilterOp::Includes),
            "$XINCLUDES" => Some(FilterOp::Xincludes),
            "$LIKE" => Some(FilterOp::Like),
            "$NLIKE" => Some(FilterOp::Nlike),
            _ => None,
        }
    }

    /// The native operator text this maps to.
    pub fn aql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "==",
            FilterOp::Ne => "!=",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::In | FilterOp::Includes => "IN",
            FilterOp::Xin | FilterOp::Xincludes => "NOT IN",
            FilterOp::Like => "LIKE",
            FilterOp::Nlike => "NOT LIKE",
        }
    }

    /// Containment operators put the value on the left-hand side:
    /// `value IN alias.path`.
    pub fn reversed(&self) -> bool {
        matches!(self, FilterOp::Includes | FilterOp::Xincludes)
    }
}

/// Connective of a `$and`/`$or`/`$not`/`$nor` group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
    Not,
    Nor,
}

impl LogicOp {
    pub fn parse(key: &str) -> Option<LogicOp> {
        match key.to_uppercase().as_str() {
            "$AND" => Some(LogicOp::And),
            "$OR" => Some(LogicOp::Or),
            "$NOT" => Some(LogicOp::Not),
            "$NOR" => Some(LogicOp::Nor),
            _ => None,
        }
    }

    pub fn connective(&self) -> &'static str {
        match self {
            LogicOp::And => " AND ",
            LogicOp::Or => " OR ",
            LogicOp::Not => " NOT ",
            LogicOp::Nor => " NOR ",
        }
    }
}

/// One `path / operator / value` leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub path: String,
    pub op: FilterOp,
    pub value: Value,
}

/// A top-level filter entry. Each clause compiles to one `FILTER (...)` line;
/// sibling clauses are conjoined by the target engine.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterClause {
    Leaf(Condition),
    /// A logic group: every alternative map becomes its own clause whose
    /// leaves are joined by the group's connective.
    Group {
        logic: LogicOp,
        alternatives: Vec<Vec<Condition>>,
    },
}

/// Parsed form of a filter sub-tree, preserving entry order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSet {
    pub clauses: Vec<FilterClause>,
}

impl FilterSet {
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// All field paths referenced by the filter, in first-seen order.
    pub fn paths(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for clause in &self.clauses {
            let conds: Vec<&Condition> = match clause {
                FilterClause::Leaf(c) => vec![c],
                FilterClause::Group { alternatives, .. } => {
                    alternatives.iter().flatten().collect()
                }
            };
            for c in conds {
                if !out.contains(&c.path.as_str()) {
                    out.push(&c.path);
                }
            }
        }
        out
    }

    /// A copy of this filter with macros expanded in every leaf value.
    pub fn evaluated(&self, macros: &MacroRegistry) -> FilterSet {
        let eval_cond = |c: &Condition| Condition {
            path: c.path.clone(),
            op: c.op,
            value: macros.eval(&c.value),
        };
        FilterSet {
            clauses: self
                .clauses
                .iter()
                .map(|clause| match clause {
                    FilterClause::Leaf(c) => FilterClause::Leaf(eval_cond(c)),
                    FilterClause::Group {
                        logic,
                        alternatives,
                    } => FilterClause::Group {
                        logic: *logic,
                        alternatives: alternatives
                            .iter()
                            .map(|alt| alt.iter().map(eval_cond).collect())
                            .collect(),
                    },
                })
                .collect(),
        }
    }
}

/// Parse a filter sub-tree.
///
/// Keys are either `path` / `path:$op` leaves (missing operator means `$eq`)
/// or logic keys (`$and`, `$or`, `$not`, `$nor`) whose value is a map of
/// leaves or a list of such maps.
pub fn parse_filters(filters: &Map<String, Value>) -> Result<FilterSet, QueryError> {
    let mut clauses = Vec::new();

    for (key, value) in filters {
        if key.starts_with('$') {
            let Some(logic) = LogicOp::parse(key) else {
                return Err(QueryError::InvalidLogic(key.clone()));
            };
            let alternative_maps: Vec<&Map<String, Value>> = match value {
                Value::Object(map) => vec![map],
                Value::Array(items) => {
                    let mut maps = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Value::Object(map) => maps.push(map),
                            _ => return Err(QueryError::InvalidLogic(key.clone())),
                        }
                    }
                    maps
                }
                _ => return Err(QueryError::InvalidLogic(key.clone())),
            };

            let mut alternatives = Vec::with_capacity(alternative_maps.len());
            for map in alternative_maps {
                let mut conditions = Vec::with_capacity(map.len());
                for (leaf_key, leaf_value) in map {
                    conditions.push(parse_condition(leaf_key, leaf_value)?);
                }
                alternatives.push(conditions);
            }
            clauses.push(FilterClause::Group {
                logic,
                alternatives,
            });
        } else {
            clauses.push(FilterClause::Leaf(parse_condition(key, value)?));
        }
    }

    Ok(FilterSet { clauses })
}

fn parse_condition(key: &str, value: &Value) -> Result<Condition, QueryError> {
    let (path, op) = match key.split_once(':') {
        Some((path, op)) => {
            let parsed = FilterOp::parse(op).ok_or_else(|| {
                QueryError::UnknownOperator(op.to_string())
            })?;
            (path, parsed)
        }
        None => (key, FilterOp::Eq),
    };
    Ok(Condition {
        path: path.to_string(),
        op,
        value: value.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filters(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn bare_key_is_implicit_eq() {
        let set = parse_filters(&filters(json!({"status": "active"}))).unwrap();
        assert_eq!(set.clauses.len(), 1);
        match &set.clauses[0] {
            FilterClause::Leaf(c) => {
                assert_eq!(c.path, "status");
                assert_eq!(c.op, FilterOp::Eq);
                assert_eq!(c.value, json!("active"));
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn operator_suffix_is_parsed() {
        let set = parse_filters(&filters(json!({"age:$gt": 18}))).unwrap();
        match &set.clauses[0] {
            FilterClause::Leaf(c) => {
                assert_eq!(c.path, "age");
                assert_eq!(c.op, FilterOp::Gt);
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn operator_is_case_insensitive() {
        let set = parse_filters(&filters(json!({"age:$GTE": 18}))).unwrap();
        match &set.clauses[0] {
            FilterClause::Leaf(c) => assert_eq!(c.op, FilterOp::Gte),
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn all_operators_parse() {
        for (suffix, op) in [
            ("$eq", FilterOp::Eq),
            ("$ne", FilterOp::Ne),
            ("$gt", FilterOp::Gt),
            ("$gte", FilterOp::Gte),
            ("$lt", FilterOp::Lt),
            ("$lte", FilterOp::Lte),
            ("$in", FilterOp::In),
            ("$xin", FilterOp::Xin),
            ("$includes", FilterOp::Includes),
            ("$xincludes", FilterOp::Xincludes),
            ("$like", FilterOp::Like),
            ("$nlike", FilterOp::Nlike),
        ] {
            let mut map = Map::new();
            map.insert(format!("f:{suffix}"), json!(1));
            let set = parse_filters(&map).unwrap();
            match &set.clauses[0] {
                FilterClause::Leaf(c) => assert_eq!(c.op, op, "{suffix}"),
                other => panic!("expected leaf, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_operator_errors() {
        let err = parse_filters(&filters(json!({"age:$between": 5}))).unwrap_err();
        assert_eq!(err, QueryError::UnknownOperator("$between".into()));
    }

    #[test]
    fn or_group_with_list() {
        let set = parse_filters(&filters(json!({
            "$or": [
                {"status": "active", "score:$gt": 10},
                {"status": "pending"}
            ]
        })))
        .unwrap();
        match &set.clauses[0] {
            FilterClause::Group {
                logic,
                alternatives,
            } => {
                assert_eq!(*logic, LogicOp::Or);
                assert_eq!(alternatives.len(), 2);
                assert_eq!(alternatives[0].len(), 2);
                assert_eq!(alternatives[1].len(), 1);
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn logic_group_accepts_single_map() {
        let set = parse_filters(&filters(json!({"$and": {"a": 1, "b": 2}}))).unwrap();
        match &set.clauses[0] {
            FilterClause::Group { alternatives, .. } => {
                assert_eq!(alternatives.len(), 1);
                assert_eq!(alternatives[0].len(), 2);
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn logic_group_rejects_scalar_operand() {
        let err = parse_filters(&filters(json!({"$or": 42}))).unwrap_err();
        assert_eq!(err, QueryError::InvalidLogic("$or".into()));
    }

    #[test]
    fn logic_group_rejects_scalar_list_element() {
        let err = parse_filters(&filters(json!({"$and": [1, 2]}))).unwrap_err();
        assert_eq!(err, QueryError::InvalidLogic("$and".into()));
    }

    #[test]
    fn unknown_dollar_key_is_invalid_logic() {
        let err = parse_filters(&filters(json!({"$xor": [{"a": 1}]}))).unwrap_err();
        assert_eq!(err, QueryError::InvalidLogic("$xor".into()));
    }

    #[test]
    fn paths_are_deduplicated_in_order() {
        let set = parse_filters(&filters(json!({
            "b:$gt": 1,
            "a": 2,
            "$or": [{"b:$lt": 9, "c": 3}]
        })))
        .unwrap();
        assert_eq!(set.paths(), vec!["b", "a", "c"]);
    }
}
