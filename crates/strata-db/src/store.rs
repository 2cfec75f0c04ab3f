//! Contracts against the external engine.
//!
//! The core never talks to a database directly: persistence goes through
//! [`Store`], compiled queries through [`QueryExecutor`], and graph walks
//! through [`Graph`]. Implementations wrap the actual driver.

use std::fmt;

use serde_json::{Map, Value};

use crate::document::DocumentShell;
use crate::error::DbError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(String),
    Conflict(String),
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(key) => write!(f, "not found: {key}"),
            StoreError::Conflict(key) => write!(f, "conflict: {key}"),
            StoreError::Backend(msg) => write!(f, "backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Document persistence offered by the external engine.
pub trait Store {
    fn has(&self, key: &str) -> Result<bool, StoreError>;
    fn get(&self, key: &str) -> Result<Option<Map<String, Value>>, StoreError>;
    /// Insert a document; `silent` suppresses the returned copy.
    fn insert(
        &mut self,
        doc: &Map<String, Value>,
        silent: bool,
    ) -> Result<Option<Map<String, Value>>, StoreError>;
    /// Merge-update by `_key`; fails with [`StoreError::NotFound`] when the
    /// document does not exist.
    fn update(
        &mut self,
        doc: &Map<String, Value>,
        return_new: bool,
    ) -> Result<Map<String, Value>, StoreError>;
    /// Replace by `_key` without merging.
    fn replace(
        &mut self,
        doc: &Map<String, Value>,
        return_new: bool,
    ) -> Result<Map<String, Value>, StoreError>;
    fn delete(&mut self, key: &str) -> Result<(), StoreError>;
    fn find(
        &self,
        filter: &Map<String, Value>,
        limit: usize,
    ) -> Result<Vec<Map<String, Value>>, StoreError>;
}

/// Commit a shell's document, retrying once as an insert when the update
/// reports the document missing.
pub fn commit_document<S: Store>(
    store: &mut S,
    shell: &DocumentShell,
) -> Result<Map<String, Value>, DbError> {
    let doc = shell.to_doc();
    match store.update(&doc, true) {
        Ok(new) => Ok(new),
        Err(StoreError::NotFound(_)) => {
            store.insert(&doc, false)?.ok_or(DbError::MissingKey)
        }
        Err(e) => Err(e.into()),
    }
}

/// Cursor statistics reported by the query engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorStats {
    /// Total matches before LIMIT was applied.
    pub full_count: u64,
}

/// A result cursor from the external query engine.
pub trait QueryCursor: Iterator<Item = Result<Value, StoreError>> {
    /// Number of documents in the current batch.
    fn count(&self) -> usize;
    fn statistics(&self) -> CursorStats;
}

/// Executes a compiled query against the external engine.
pub trait QueryExecutor {
    type Cursor: QueryCursor;

    fn execute(
        &self,
        query: &str,
        bind_vars: &Map<String, Value>,
        count: bool,
        full_count: bool,
    ) -> Result<Self::Cursor, StoreError>;
}

/// Graph traversal offered by the external engine.
pub trait Graph {
    /// Walk from `start_vertex`, returning the vertex list of every path.
    #[allow(clippy::too_many_arguments)]
    fn traverse(
        &self,
        start_vertex: &str,
        direction: &str,
        strategy: &str,
        edge_uniqueness: &str,
        vertex_uniqueness: &str,
        min_depth: usize,
    ) -> Result<Vec<Vec<Value>>, StoreError>;
}

/// The edge collection linking two vertex collections.
pub fn edge_collection_name(from: &str, to: &str) -> String {
    format!("edges__{from}--{to}")
}

/// The graph spanning a chain of edge collections.
pub fn graph_name(edges: &str) -> String {
    format!("graph__{edges}")
}

/// A parsed slash-path addressing a document or one of its descendants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemPath<'a> {
    Document {
        collection: &'a str,
        key: &'a str,
    },
    Subcollection {
        collection: &'a str,
        key: &'a str,
        name: &'a str,
    },
    SubDocument {
        collection: &'a str,
        key: &'a str,
        name: &'a str,
        sub_key: &'a str,
    },
}

/// Parse `coll/key`, `coll/key/sub`, or `coll/key/sub/subkey`.
pub fn parse_item_path(path: &str) -> Result<ItemPath<'_>, DbError> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(DbError::InvalidPath(path.to_string()));
    }
    match parts.as_slice() {
        [collection, key] => Ok(ItemPath::Document { collection, key }),
        [collection, key, name] => Ok(ItemPath::Subcollection {
            collection,
            key,
            name,
        }),
        [collection, key, name, sub_key] => Ok(ItemPath::SubDocument {
            collection,
            key,
            name,
            sub_key,
        }),
        _ => Err(DbError::InvalidPath(path.to_string())),
    }
}
