//! Dotted-path codec over JSON documents.
//!
//! Nested mappings flatten to a single level keyed by dotted paths. Arrays
//! are leaves: they are not descended, but their mapping elements are each
//! flattened recursively so the codec round-trips documents that embed lists
//! of sub-documents.

use serde_json::{Map, Value};

use crate::error::DbError;

/// Flatten a nested document into dotted-path keys.
pub fn flatten(doc: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    flatten_into(&mut out, "", doc);
    out
}

fn flatten_into(out: &mut Map<String, Value>, prefix: &str, doc: &Map<String, Value>) {
    for (key, value) in doc {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(map) => flatten_into(out, &path, map),
            Value::Array(items) => {
                out.insert(path, Value::Array(items.iter().map(flatten_element).collect()));
            }
            other => {
                out.insert(path, other.clone());
            }
        }
    }
}

fn flatten_element(item: &Value) -> Value {
    match item {
        Value::Object(map) => Value::Object(flatten(map)),
        other => other.clone(),
    }
}

/// Rebuild a nested document from dotted-path keys.
///
/// Fails with [`DbError::PathConflict`] when a scalar already occupies an
/// intermediate segment of some key.
pub fn unflatten(flat: &Map<String, Value>) -> Result<Map<String, Value>, DbError> {
    let mut out = Map::new();
    for (key, value) in flat {
        let value = match value {
            Value::Array(items) => {
                let mut rebuilt = Vec::with_capacity(items.len());
                for item in items {
                    rebuilt.push(match item {
                        Value::Object(map) => Value::Object(unflatten(map)?),
                        other => other.clone(),
                    });
                }
                Value::Array(rebuilt)
            }
            other => other.clone(),
        };
        set_nested(&mut out, key, value)?;
    }
    Ok(out)
}

fn set_nested(root: &mut Map<String, Value>, path: &str, value: Value) -> Result<(), DbError> {
    let mut segments = path.split('.').peekable();
    let mut current = root;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return Ok(());
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => return Err(DbError::PathConflict(path.to_string())),
        };
    }
    Ok(())
}

/// Look up a value by dotted path starting from a document's field map.
pub fn get_in<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    match path.split_once('.') {
        None => map.get(path),
        Some((head, rest)) => get(map.get(head)?, rest),
    }
}

/// Look up a value by dotted path. Numeric segments index into arrays.
pub fn get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Set a value by dotted path, auto-creating intermediate mappings.
pub fn set(value: &mut Value, path: &str, new: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = value;
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().unwrap();
        if segments.peek().is_none() {
            map.insert(segment.to_string(), new);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Remove and return the value at a dotted path.
pub fn pop(value: &mut Value, path: &str) -> Option<Value> {
    let (parent_path, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };
    let parent = match parent_path {
        Some(p) => get_mut(value, p)?,
        None => value,
    };
    parent.as_object_mut()?.shift_remove(leaf)
}

fn get_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get_mut(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}
