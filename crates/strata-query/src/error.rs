use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    /// A `$and`/`$or`/`$not`/`$nor` key whose operand is not a map or list of maps.
    InvalidLogic(String),
    /// An unrecognized `:$op` suffix on a filter key.
    UnknownOperator(String),
    /// The query tree has no FROM collection.
    MissingFrom,
    /// The tree could not be decoded into an XQL query.
    InvalidXql(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::InvalidLogic(key) => write!(f, "invalid logic: {key}"),
            QueryError::UnknownOperator(op) => write!(f, "unknown filter operator: {op}"),
            QueryError::MissingFrom => write!(f, "query has no FROM collection"),
            QueryError::InvalidXql(msg) => write!(f, "invalid query tree: {msg}"),
        }
    }
}

impl std::error::Error for QueryError {}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        QueryError::InvalidXql(e.to_string())
    }
}
