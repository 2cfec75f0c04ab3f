use std::fmt;

use strata_query::QueryError;

use crate::store::StoreError;

#[derive(Debug)]
pub enum DbError {
    /// A document without a `_key`.
    MissingKey,
    /// A shell with no bound commit callback.
    MissingCommitCallback,
    /// A slash-path that does not parse.
    InvalidPath(String),
    /// Insert collision on an existing key.
    ItemExists(String),
    ItemNotFound(String),
    CollectionNotFound(String),
    /// A subcollection insert violating a constraint path.
    ConstraintViolation(String),
    /// An operator found an int/list precondition unmet.
    TypeMismatch(String),
    /// A scalar occupies a path segment where a mapping is required.
    PathConflict(String),
    Query(QueryError),
    Store(StoreError),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::MissingKey => write!(f, "document has no _key"),
            DbError::MissingCommitCallback => write!(f, "shell has no commit callback"),
            DbError::InvalidPath(path) => write!(f, "invalid item path: {path}"),
            DbError::ItemExists(key) => write!(f, "item exists: {key}"),
            DbError::ItemNotFound(key) => write!(f, "item not found: {key}"),
            DbError::CollectionNotFound(name) => write!(f, "collection not found: {name}"),
            DbError::ConstraintViolation(path) => write!(f, "constraint violation: {path}"),
            DbError::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            DbError::PathConflict(path) => write!(f, "path conflict at '{path}'"),
            DbError::Query(e) => write!(f, "query error: {e}"),
            DbError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<QueryError> for DbError {
    fn from(e: QueryError) -> Self {
        DbError::Query(e)
    }
}

impl From<StoreError> for DbError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => DbError::ItemNotFound(key),
            StoreError::Conflict(key) => DbError::ItemExists(key),
            other => DbError::Store(other),
        }
    }
}
