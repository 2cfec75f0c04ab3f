//! Stateful document shells.
//!
//! A [`DocumentShell`] holds one document, batches mutations locally through
//! the mutation engine, and flushes to the store on
//! [`commit`](DocumentShell::commit). Subcollections stored inline under the
//! document's reserved key are edited through [`SubCollection`] and
//! [`SubDocShell`], which write through to the parent; the parent persists
//! them on its own commit.

use serde_json::{Map, Value};
use uuid::Uuid;

use strata_query::Sort;
use strata_query::timeshift;

use crate::dict_query::{self, Cursor};
use crate::error::DbError;
use crate::mutator::{self, CustomOps, Oplog};
use crate::path;

/// Reserved key holding embedded subcollections in the persisted document.
pub const SUBCOLLECTIONS_KEY: &str = "__subcollections";

/// Reserved key used by earlier revisions; migrated on load.
const LEGACY_SUBCOLLECTIONS_KEY: &str = "/subcollections";

/// Persists a shell's document, returning the stored copy to reload from.
pub type Committer = Box<dyn FnMut(&DocumentShell) -> Result<Option<Map<String, Value>>, DbError>>;

/// Removes a document from the store by key.
pub type Deleter = Box<dyn FnMut(&str) -> Result<(), DbError>>;

fn generate_key() -> String {
    Uuid::new_v4().simple().to_string()
}

fn patch1(key: String, value: Value) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert(key, value);
    patch
}

/// The mutation surface shared by documents and sub-documents.
///
/// Every mutation funnels through [`apply`](DocumentOps::apply), which runs
/// the mutation engine and returns the oplog. None of these methods perform
/// I/O.
pub trait DocumentOps {
    fn fields(&self) -> &Map<String, Value>;

    /// Apply a raw patch and return the oplog.
    fn apply(&mut self, patch: Map<String, Value>) -> Result<Oplog, DbError>;

    fn get(&self, path: &str) -> Option<&Value> {
        path::get_in(self.fields(), path)
    }

    fn get_or(&self, path: &str, default: Value) -> Value {
        self.get(path).cloned().unwrap_or(default)
    }

    /// Length of the str/list/map at a path; 0 when missing or unmeasurable.
    fn len_of(&self, path: &str) -> usize {
        match self.get(path) {
            Some(Value::Array(items)) => items.len(),
            Some(Value::Object(map)) => map.len(),
            Some(Value::String(s)) => s.chars().count(),
            _ => 0,
        }
    }

    fn set(&mut self, path: &str, value: Value) -> Result<(), DbError> {
        self.apply(patch1(path.to_string(), value)).map(|_| ())
    }

    /// Remove a path, returning the removed value.
    fn unset(&mut self, path: &str) -> Result<Option<Value>, DbError> {
        let op = format!("{path}:$unset");
        let mut oplog = self.apply(patch1(op.clone(), Value::Bool(true)))?;
        Ok(oplog.shift_remove(&op))
    }

    fn incr(&mut self, path: &str, by: i64) -> Result<i64, DbError> {
        let op = format!("{path}:$incr");
        let oplog = self.apply(patch1(op.clone(), Value::from(by)))?;
        Ok(oplog.get(&op).and_then(Value::as_i64).unwrap_or(0))
    }

    fn decr(&mut self, path: &str, by: i64) -> Result<i64, DbError> {
        let op = format!("{path}:$decr");
        let oplog = self.apply(patch1(op.clone(), Value::from(by)))?;
        Ok(oplog.get(&op).and_then(Value::as_i64).unwrap_or(0))
    }

    fn rename(&mut self, path: &str, new_path: &str) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$rename"), Value::from(new_path)))
            .map(|_| ())
    }

    fn copy(&mut self, path: &str, new_path: &str) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$copy"), Value::from(new_path)))
            .map(|_| ())
    }

    fn xadd(&mut self, path: &str, value: Value) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$xadd"), value)).map(|_| ())
    }

    fn xadd_many(&mut self, path: &str, values: Vec<Value>) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$xadd_many"), Value::Array(values)))
            .map(|_| ())
    }

    fn xrem(&mut self, path: &str, value: Value) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$xrem"), value)).map(|_| ())
    }

    fn xrem_many(&mut self, path: &str, values: Vec<Value>) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$xrem_many"), Value::Array(values)))
            .map(|_| ())
    }

    fn xpush(&mut self, path: &str, value: Value) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$xpush"), value)).map(|_| ())
    }

    fn xpush_many(&mut self, path: &str, values: Vec<Value>) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$xpush_many"), Value::Array(values)))
            .map(|_| ())
    }

    fn xpushl(&mut self, path: &str, value: Value) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$xpushl"), value)).map(|_| ())
    }

    fn xpushl_many(&mut self, path: &str, values: Vec<Value>) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$xpushl_many"), Value::Array(values)))
            .map(|_| ())
    }

    /// Remove and return the tail element of a list.
    fn xpop(&mut self, path: &str) -> Result<Option<Value>, DbError> {
        let op = format!("{path}:$xpop");
        let mut oplog = self.apply(patch1(op.clone(), Value::Bool(true)))?;
        Ok(oplog.shift_remove(&op))
    }

    /// Remove and return the head element of a list.
    fn xpopl(&mut self, path: &str) -> Result<Option<Value>, DbError> {
        let op = format!("{path}:$xpopl");
        let mut oplog = self.apply(patch1(op.clone(), Value::Bool(true)))?;
        Ok(oplog.shift_remove(&op))
    }

    /// Write the current UTC time at a path.
    fn timestamp(&mut self, path: &str) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$timestamp"), Value::Bool(true)))
            .map(|_| ())
    }

    /// Write the current UTC time shifted by a human-time expression.
    fn timestamp_with(&mut self, path: &str, shifter: &str) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$timestamp"), Value::from(shifter)))
            .map(|_| ())
    }

    fn template(&mut self, path: &str, source: &str) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$template"), Value::from(source)))
            .map(|_| ())
    }

    fn uuid4(&mut self, path: &str) -> Result<(), DbError> {
        self.apply(patch1(format!("{path}:$uuid4"), Value::Bool(true)))
            .map(|_| ())
    }

    /// Batch an arbitrary patch.
    fn update(&mut self, patch: Map<String, Value>) -> Result<Oplog, DbError> {
        self.apply(patch)
    }
}

impl std::fmt::Debug for DocumentShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentShell")
            .field("key", &self.key)
            .field("fields", &self.fields)
            .field("subcollections", &self.subcollections)
            .field("immut_keys", &self.immut_keys)
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// A stateful holder of one document.
pub struct DocumentShell {
    key: String,
    fields: Map<String, Value>,
    subcollections: Map<String, Value>,
    immut_keys: Vec<String>,
    custom_ops: CustomOps,
    committer: Option<Committer>,
    deleter: Option<Deleter>,
    read_only: bool,
}

impl DocumentShell {
    /// Load an existing document. The document must carry a `_key`.
    ///
    /// The data passes through the mutation engine, so operator-qualified
    /// keys embedded in it are applied.
    pub fn load(data: Map<String, Value>) -> Result<Self, DbError> {
        if !data.contains_key("_key") {
            return Err(DbError::MissingKey);
        }
        let mut shell = DocumentShell {
            key: String::new(),
            fields: Map::new(),
            subcollections: Map::new(),
            immut_keys: Vec::new(),
            custom_ops: CustomOps::new(),
            committer: None,
            deleter: None,
            read_only: false,
        };
        let (doc, _) = mutator::mutate(&data, &Map::new(), &[], &shell.custom_ops)?;
        shell.reload(doc);
        Ok(shell)
    }

    /// Create a fresh document, seeding `_key` (minted when absent),
    /// `_created_at`, and `_modified_at`.
    pub fn new_document(data: Map<String, Value>) -> Result<Self, DbError> {
        let mut data = data;
        if !data.contains_key("_key") {
            data.insert("_key".to_string(), Value::from(generate_key()));
        }
        data.insert("_created_at:$timestamp".to_string(), Value::Bool(true));
        data.insert("_modified_at".to_string(), Value::Null);
        Self::load(data)
    }

    pub fn with_committer(mut self, committer: Committer) -> Self {
        self.committer = Some(committer);
        self
    }

    pub fn with_deleter(mut self, deleter: Deleter) -> Self {
        self.deleter = Some(deleter);
        self
    }

    pub fn with_immut_keys(mut self, immut_keys: Vec<String>) -> Self {
        self.immut_keys = immut_keys;
        self
    }

    pub fn with_custom_ops(mut self, custom_ops: CustomOps) -> Self {
        self.custom_ops = custom_ops;
        self
    }

    /// A read-only shell silently ignores mutations and commits.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn immut_keys(&self) -> &[String] {
        &self.immut_keys
    }

    /// The persisted representation: the fields plus the reserved
    /// subcollections key when any subcollection exists.
    pub fn to_doc(&self) -> Map<String, Value> {
        let mut doc = self.fields.clone();
        if !self.subcollections.is_empty() {
            doc.insert(
                SUBCOLLECTIONS_KEY.to_string(),
                Value::Object(self.subcollections.clone()),
            );
        }
        doc
    }

    /// Flush to the store through the bound committer and reload from the
    /// stored copy.
    pub fn commit(&mut self) -> Result<(), DbError> {
        if self.read_only {
            return Ok(());
        }
        if self.committer.is_none() {
            return Err(DbError::MissingCommitCallback);
        }
        self.apply(patch1(
            "_modified_at:$timestamp".to_string(),
            Value::Bool(true),
        ))?;
        let mut committer = self.committer.take().expect("checked above");
        let result = committer(self);
        self.committer = Some(committer);
        if let Some(doc) = result? {
            self.reload(doc);
        }
        Ok(())
    }

    /// Set the eviction timestamp by a shifter, or clear it with `None`.
    pub fn set_ttl(&mut self, shifter: Option<&str>) -> Result<(), DbError> {
        match shifter {
            Some(s) => self.apply(patch1("__ttl:$timestamp".to_string(), Value::from(s))),
            None => self.apply(patch1("__ttl".to_string(), Value::Null)),
        }
        .map(|_| ())
    }

    /// Remove the document from the store through the bound deleter.
    pub fn delete(&mut self) -> Result<(), DbError> {
        let Some(mut deleter) = self.deleter.take() else {
            return Err(DbError::MissingCommitCallback);
        };
        let key = self.key.clone();
        let result = deleter(&key);
        self.deleter = Some(deleter);
        result
    }

    pub fn subcollection_names(&self) -> Vec<&str> {
        self.subcollections.keys().map(String::as_str).collect()
    }

    pub fn select_subcollection(&mut self, name: &str) -> SubCollection<'_> {
        SubCollection {
            parent: self,
            name: name.to_string(),
            constraints: Vec::new(),
        }
    }

    /// Select a subcollection with constraint paths: an insert whose value at
    /// any constraint path already exists fails.
    pub fn select_subcollection_with(
        &mut self,
        name: &str,
        constraints: Vec<String>,
    ) -> SubCollection<'_> {
        SubCollection {
            parent: self,
            name: name.to_string(),
            constraints,
        }
    }

    pub fn drop_subcollection(&mut self, name: &str) {
        self.subcollections.shift_remove(name);
    }

    /// Run a closure against the shell and commit on exit. The closure's
    /// error wins over a commit failure.
    pub fn context<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let out = f(self);
        let committed = self.commit();
        let value = out?;
        committed?;
        Ok(value)
    }

    /// Run a closure against a subcollection and commit the parent on exit.
    pub fn context_subcollection<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut SubCollection<'_>) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let out = {
            let mut sub = self.select_subcollection(name);
            f(&mut sub)
        };
        let committed = self.commit();
        let value = out?;
        committed?;
        Ok(value)
    }

    fn set_subcollection(&mut self, name: &str, items: Vec<Value>) {
        self.subcollections
            .insert(name.to_string(), Value::Array(items));
    }

    fn subcollection_items(&self, name: &str) -> Vec<Value> {
        match self.subcollections.get(name) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    fn reload(&mut self, mut doc: Map<String, Value>) {
        if let Some(legacy) = doc.shift_remove(LEGACY_SUBCOLLECTIONS_KEY) {
            if !doc.contains_key(SUBCOLLECTIONS_KEY) {
                doc.insert(SUBCOLLECTIONS_KEY.to_string(), legacy);
            }
        }
        self.subcollections = match doc.shift_remove(SUBCOLLECTIONS_KEY) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        match doc.get("_key").and_then(Value::as_str) {
            Some(key) => self.key = key.to_string(),
            // `_key` is immutable: restore it if a mutation dropped it.
            None => {
                doc.insert("_key".to_string(), Value::from(self.key.clone()));
            }
        }
        self.fields = doc;
    }
}

impl DocumentOps for DocumentShell {
    fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    fn apply(&mut self, patch: Map<String, Value>) -> Result<Oplog, DbError> {
        if self.read_only {
            return Ok(Oplog::new());
        }
        let init = self.to_doc();
        let (doc, oplog) = mutator::mutate(&patch, &init, &self.immut_keys, &self.custom_ops)?;
        self.reload(doc);
        Ok(oplog)
    }
}

/// A view over one named subcollection of a parent document.
///
/// All edits write through to the parent's subcollection map; the parent
/// persists them on its own commit.
pub struct SubCollection<'a> {
    parent: &'a mut DocumentShell,
    name: String,
    constraints: Vec<String>,
}

impl SubCollection<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.parent.subcollection_items(&self.name).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has(&self, key: &str) -> Result<bool, DbError> {
        Ok(self.find_one(&patch1("_key".to_string(), Value::from(key)))?.is_some())
    }

    /// Insert a sub-document. The data passes through the mutation engine,
    /// then constraint paths and key collisions are checked, and system
    /// fields are seeded.
    pub fn insert(&mut self, data: Map<String, Value>) -> Result<Map<String, Value>, DbError> {
        let (mut doc, _) = mutator::mutate(
            &data,
            &Map::new(),
            &self.parent.immut_keys,
            &self.parent.custom_ops,
        )?;

        for constraint in &self.constraints {
            if let Some(value) = path::get_in(&doc, constraint) {
                let filter = patch1(constraint.clone(), value.clone());
                if self.find_one(&filter)?.is_some() {
                    return Err(DbError::ConstraintViolation(constraint.clone()));
                }
            }
        }

        if let Some(key) = doc.get("_key").and_then(Value::as_str) {
            if self.has(key)? {
                return Err(DbError::ItemExists(key.to_string()));
            }
        } else {
            doc.insert("_key".to_string(), Value::from(generate_key()));
        }
        doc.insert(
            "_created_at".to_string(),
            Value::from(timeshift::iso_datetime(timeshift::utc_now())),
        );
        doc.insert("_modified_at".to_string(), Value::Null);

        let mut items = self.parent.subcollection_items(&self.name);
        items.push(Value::Object(doc.clone()));
        self.parent.set_subcollection(&self.name, items);
        Ok(doc)
    }

    /// Query the subcollection in memory.
    pub fn find(
        &self,
        filters: &Map<String, Value>,
        sorts: &[Sort],
        limit: usize,
        offset: usize,
    ) -> Result<Cursor, DbError> {
        let matched = dict_query::query(&self.parent.subcollection_items(&self.name), filters)?;
        Ok(Cursor::new(matched, sorts, offset, limit))
    }

    pub fn find_one(&self, filters: &Map<String, Value>) -> Result<Option<Value>, DbError> {
        Ok(self.find(filters, &[], 1, 0)?.next())
    }

    /// A mutable shell over one sub-document.
    pub fn get(&mut self, key: &str) -> Result<Option<SubDocShell<'_>>, DbError> {
        let found = self.find_one(&patch1("_key".to_string(), Value::from(key)))?;
        let Some(Value::Object(data)) = found else {
            return Ok(None);
        };
        Ok(Some(SubDocShell {
            parent: &mut *self.parent,
            collection: self.name.clone(),
            key: key.to_string(),
            data,
        }))
    }

    /// Patch every matching sub-document; insert the patch as a new
    /// sub-document when nothing matched and `upsert` is set. Returns the
    /// number of documents written.
    pub fn update(
        &mut self,
        filters: &Map<String, Value>,
        patch: &Map<String, Value>,
        upsert: bool,
    ) -> Result<usize, DbError> {
        let matched = dict_query::query(&self.parent.subcollection_items(&self.name), filters)?;
        if matched.is_empty() {
            if upsert {
                self.insert(patch.clone())?;
                return Ok(1);
            }
            return Ok(0);
        }

        let mut items = self.parent.subcollection_items(&self.name);
        let mut written = 0;
        for doc in matched {
            let Value::Object(init) = doc else { continue };
            let key = init.get("_key").cloned();
            let (mut updated, _) = mutator::mutate(
                patch,
                &init,
                &self.parent.immut_keys,
                &self.parent.custom_ops,
            )?;
            if let Some(key) = key.clone() {
                updated.insert("_key".to_string(), key);
            }
            if let Some(slot) = items
                .iter_mut()
                .find(|item| item.get("_key") == key.as_ref())
            {
                *slot = Value::Object(updated);
                written += 1;
            }
        }
        self.parent.set_subcollection(&self.name, items);
        Ok(written)
    }

    /// Delete every matching sub-document, returning how many were removed.
    pub fn delete(&mut self, filters: &Map<String, Value>) -> Result<usize, DbError> {
        let matched = dict_query::query(&self.parent.subcollection_items(&self.name), filters)?;
        let keys: Vec<Value> = matched
            .iter()
            .filter_map(|doc| doc.get("_key").cloned())
            .collect();
        let mut items = self.parent.subcollection_items(&self.name);
        let before = items.len();
        items.retain(|item| {
            !item
                .get("_key")
                .map(|k| keys.contains(k))
                .unwrap_or(false)
        });
        let removed = before - items.len();
        self.parent.set_subcollection(&self.name, items);
        Ok(removed)
    }
}

/// The same mutation surface as [`DocumentShell`], bound to one sub-document
/// and flushing into the parent's subcollection map on every change.
pub struct SubDocShell<'a> {
    parent: &'a mut DocumentShell,
    collection: String,
    key: String,
    data: Map<String, Value>,
}

impl SubDocShell<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn to_doc(&self) -> Map<String, Value> {
        self.data.clone()
    }
}

impl DocumentOps for SubDocShell<'_> {
    fn fields(&self) -> &Map<String, Value> {
        &self.data
    }

    fn apply(&mut self, patch: Map<String, Value>) -> Result<Oplog, DbError> {
        if self.parent.read_only {
            return Ok(Oplog::new());
        }
        let (mut doc, oplog) = mutator::mutate(
            &patch,
            &self.data,
            &self.parent.immut_keys,
            &self.parent.custom_ops,
        )?;
        doc.insert("_key".to_string(), Value::from(self.key.clone()));

        let mut items = self.parent.subcollection_items(&self.collection);
        let key = Value::from(self.key.clone());
        if let Some(slot) = items.iter_mut().find(|item| item.get("_key") == Some(&key)) {
            *slot = Value::Object(doc.clone());
        }
        self.parent.set_subcollection(&self.collection, items);
        self.data = doc;
        Ok(oplog)
    }
}
