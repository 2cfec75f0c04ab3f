//! The deep-mutation engine.
//!
//! A patch document maps operator-qualified keys (`path:$op`, bare paths
//! default to `$set`) to operand values. Applying a patch to a document
//! produces the new document plus an oplog reporting the effects of
//! operators that return something (`$incr`, `$unset`, `$xpop`, ...).
//!
//! Both the patch and the document are flattened to dotted paths first; all
//! operators work on the flat form and the result is unflattened at the end.

use serde_json::{Map, Value};
use uuid::Uuid;

use strata_query::timeshift;

use crate::error::DbError;
use crate::path;
use crate::template;

/// Per-call record of operator effects, keyed by the operator-qualified
/// patch key.
pub type Oplog = Map<String, Value>;

/// A custom operator: `fn(flat_doc, path, operand) -> new_leaf`.
///
/// Runs in the post pass, after all direct operators. Returning `None`
/// leaves the target path unchanged.
pub type CustomOpFn = fn(&Map<String, Value>, &str, &Value) -> Option<Value>;

/// Registry of custom operators by name (without the `$`).
pub type CustomOps = std::collections::BTreeMap<String, CustomOpFn>;

/// A field-level mutation operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutOp {
    /// Replace the leaf. The default for bare keys.
    Set,
    /// Add to an integer leaf; missing/null counts as 0.
    Incr,
    /// Subtract from an integer leaf.
    Decr,
    /// Remove the leaf, reporting the removed value.
    Unset,
    /// Move the leaf to a new path (post pass).
    Rename,
    /// Duplicate the leaf to a new path (post pass).
    Copy,
    /// Write the current UTC time, optionally shifted by the operand.
    Timestamp,
    /// Render the operand as a template against the document (post pass).
    Template,
    /// Write a freshly minted UUID string.
    Uuid4,
    /// Append item(s) not already present.
    Xadd { many: bool },
    /// Remove the first occurrence of item(s); skip when nothing matched.
    Xrem { many: bool },
    /// Append to the tail.
    Xpush { many: bool },
    /// Prepend to the head as a block.
    Xpushl { many: bool },
    /// Remove and report the tail element.
    Xpop,
    /// Remove and report the head element.
    Xpopl,
    /// Write the length of the value at the operand path (post pass).
    Xlen,
    /// Anything else; resolved against the custom registry in the post pass.
    Custom(String),
}

impl MutOp {
    pub fn parse(name: &str) -> MutOp {
        match name.to_lowercase().as_str() {
            "set" => MutOp::Set,
            "incr" => MutOp::Incr,
            "decr" => MutOp::Decr,
            "unset" => MutOp::Unset,
            "rename" => MutOp::Rename,
            "copy" => MutOp::Copy,
            "timestamp" | "datetime" | "currdate" => MutOp::Timestamp,
            "template" => MutOp::Template,
            "uuid4" => MutOp::Uuid4,
            "xadd" => MutOp::Xadd { many: false },
            "xadd_many" => MutOp::Xadd { many: true },
            "xrem" => MutOp::Xrem { many: false },
            "xrem_many" => MutOp::Xrem { many: true },
            "xpush" => MutOp::Xpush { many: false },
            "xpush_many" => MutOp::Xpush { many: true },
            "xpushl" => MutOp::Xpushl { many: false },
            "xpushl_many" => MutOp::Xpushl { many: true },
            "xpop" => MutOp::Xpop,
            "xpopl" => MutOp::Xpopl,
            "xlen" => MutOp::Xlen,
            other => MutOp::Custom(other.to_string()),
        }
    }

    /// Operators whose nested sub-keys are regrouped into mini-patches
    /// during restructuring.
    fn is_list_op(&self) -> bool {
        matches!(
            self,
            MutOp::Xadd { .. } | MutOp::Xrem { .. } | MutOp::Xpush { .. } | MutOp::Xpushl { .. }
        )
    }
}

/// A flat mutation operand: either a plain value or a regrouped mini-patch
/// that is itself mutated before use.
#[derive(Debug, Clone)]
enum Operand {
    Plain(Value),
    Mini(Map<String, Value>),
}

/// Apply a patch to a document.
///
/// Returns the new document and the oplog. Paths listed in `immut_keys` are
/// never touched. `custom_ops` extends the operator set; custom operators
/// run in the post pass.
pub fn mutate(
    patch: &Map<String, Value>,
    init: &Map<String, Value>,
    immut_keys: &[String],
    custom_ops: &CustomOps,
) -> Result<(Map<String, Value>, Oplog), DbError> {
    let muts = restructure(&path::flatten(patch));
    let flat_init = path::flatten(init);
    let (flat_out, oplog) = apply_flat(&muts, &flat_init, immut_keys, custom_ops)?;
    Ok((path::unflatten(&flat_out)?, oplog))
}

/// Regroup nested list-operator keys (`a:$xadd.sub`) into mini-patches and
/// default bare keys to `:$set`.
fn restructure(flat_patch: &Map<String, Value>) -> Vec<(String, Operand)> {
    let mut plain: Vec<(String, Operand)> = Vec::new();
    let mut minis: Vec<(String, Map<String, Value>)> = Vec::new();

    for (key, value) in flat_patch {
        if let Some((path, opname, rest)) = split_opkey(key) {
            if !rest.is_empty() && MutOp::parse(opname).is_list_op() {
                let opkey = format!("{path}:${opname}");
                match minis.iter_mut().find(|(k, _)| *k == opkey) {
                    Some((_, mini)) => {
                        mini.insert(rest.to_string(), value.clone());
                    }
                    None => {
                        let mut mini = Map::new();
                        mini.insert(rest.to_string(), value.clone());
                        minis.push((opkey, mini));
                    }
                }
                continue;
            }
        }
        let key = if key.contains(":$") {
            key.clone()
        } else {
            format!("{key}:$set")
        };
        plain.push((key, Operand::Plain(value.clone())));
    }

    // A regrouped key shadows a plain entry with the same operator key.
    plain.retain(|(key, _)| !minis.iter().any(|(k, _)| k == key));
    plain.extend(
        minis
            .into_iter()
            .map(|(key, mini)| (key, Operand::Mini(mini))),
    );
    plain
}

/// Split `path:$op.rest` into its parts. `rest` is empty for ordinary keys.
fn split_opkey(key: &str) -> Option<(&str, &str, &str)> {
    let idx = key.find(":$")?;
    let path = &key[..idx];
    let after = &key[idx + 2..];
    let op_end = after
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(after.len());
    let op = &after[..op_end];
    let rest = after[op_end..].trim_start_matches('.');
    Some((path, op, rest))
}

/// Parse an applied key into `(path, op)`. Returns `None` for keys that are
/// skipped outright (a `:` without an operator marker).
fn parse_key(key: &str) -> Option<(&str, MutOp)> {
    match key.find(":$") {
        Some(idx) => {
            let after = &key[idx + 2..];
            Some((&key[..idx], MutOp::parse(after)))
        }
        None if key.contains(':') => None,
        None => Some((key, MutOp::Set)),
    }
}

fn apply_flat(
    muts: &[(String, Operand)],
    init: &Map<String, Value>,
    immut_keys: &[String],
    custom_ops: &CustomOps,
) -> Result<(Map<String, Value>, Oplog), DbError> {
    let mut data = init.clone();
    let mut oplog = Oplog::new();
    let mut post: Vec<(String, String, MutOp, Value)> = Vec::new();

    for (opkey, operand) in muts {
        let Some((op_path, op)) = parse_key(opkey) else {
            continue;
        };
        if immut_keys.iter().any(|k| k == op_path) {
            continue;
        }
        let path = op_path.to_string();
        let value = resolve_operand(operand, custom_ops)?;

        match op {
            MutOp::Set => {
                data.insert(path, value);
            }
            MutOp::Incr | MutOp::Decr => {
                let current = int_at(&data, &path)?;
                let by = value.as_i64().unwrap_or(1);
                let next = if op == MutOp::Incr {
                    current + by
                } else {
                    current - by
                };
                data.insert(path, Value::from(next));
                oplog.insert(opkey.clone(), Value::from(next));
            }
            MutOp::Unset => {
                let removed = data.shift_remove(&path);
                oplog.insert(opkey.clone(), removed.unwrap_or(Value::Null));
            }
            MutOp::Timestamp => match &value {
                Value::Bool(true) => {
                    data.insert(path, Value::from(timeshift::iso_datetime(timeshift::utc_now())));
                }
                Value::String(shifter) => {
                    let shifted = timeshift::shift(timeshift::utc_now(), shifter);
                    data.insert(path, Value::from(timeshift::iso_datetime(shifted)));
                }
                _ => {}
            },
            MutOp::Uuid4 => {
                data.insert(path, Value::from(Uuid::new_v4().to_string()));
            }
            MutOp::Xadd { many } => {
                let mut list = list_at(&data, &path)?;
                for item in operand_items(value, many) {
                    if !list.contains(&item) {
                        list.push(item);
                    }
                }
                data.insert(path, Value::Array(list));
            }
            MutOp::Xrem { many } => {
                let mut list = list_at(&data, &path)?;
                let mut removed = false;
                for item in operand_items(value, many) {
                    if let Some(pos) = list.iter().position(|v| v == &item) {
                        list.remove(pos);
                        removed = true;
                    }
                }
                if removed {
                    data.insert(path, Value::Array(list));
                }
            }
            MutOp::Xpush { many } => {
                let mut list = list_at(&data, &path)?;
                list.extend(operand_items(value, many));
                data.insert(path, Value::Array(list));
            }
            MutOp::Xpushl { many } => {
                let mut block = operand_items(value, many);
                block.extend(list_at(&data, &path)?);
                data.insert(path, Value::Array(block));
            }
            MutOp::Xpop => {
                let mut list = list_at(&data, &path)?;
                if let Some(last) = list.pop() {
                    oplog.insert(opkey.clone(), last);
                    data.insert(path, Value::Array(list));
                }
            }
            MutOp::Xpopl => {
                let mut list = list_at(&data, &path)?;
                if !list.is_empty() {
                    let first = list.remove(0);
                    oplog.insert(opkey.clone(), first);
                    data.insert(path, Value::Array(list));
                }
            }
            MutOp::Template | MutOp::Xlen | MutOp::Rename | MutOp::Copy => {
                post.push((opkey.clone(), path, op, value));
            }
            MutOp::Custom(ref name) => {
                if custom_ops.contains_key(name) {
                    post.push((opkey.clone(), path, op.clone(), value));
                }
                // unknown operators are skipped
            }
        }
    }

    // Deferred operators observe the direct pass's results. Failures here
    // leave the target path unchanged.
    for (opkey, path, op, value) in post {
        if immut_keys.iter().any(|k| k == &path) {
            continue;
        }
        match op {
            MutOp::Template => match &value {
                Value::String(source) => {
                    let rendered = template::render(source, &data);
                    data.insert(path, Value::from(rendered));
                }
                _ => tracing::debug!(%opkey, "template operand is not a string, skipped"),
            },
            MutOp::Xlen => match &value {
                Value::String(source) if !source.is_empty() => {
                    let len = data.get(source).map(measure).unwrap_or(0);
                    data.insert(path, Value::from(len));
                }
                _ => tracing::debug!(%opkey, "xlen operand is not a source path, skipped"),
            },
            MutOp::Rename => match &value {
                Value::String(new_path) if !new_path.is_empty() => {
                    match data.shift_remove(&path) {
                        Some(v) => {
                            data.insert(new_path.clone(), v);
                        }
                        None => tracing::debug!(%opkey, "rename source missing, skipped"),
                    }
                }
                _ => tracing::debug!(%opkey, "rename operand is not a path, skipped"),
            },
            MutOp::Copy => match &value {
                Value::String(new_path) if !new_path.is_empty() => {
                    match data.get(&path).cloned() {
                        Some(v) => {
                            data.insert(new_path.clone(), v);
                        }
                        None => tracing::debug!(%opkey, "copy source missing, skipped"),
                    }
                }
                _ => tracing::debug!(%opkey, "copy operand is not a path, skipped"),
            },
            MutOp::Custom(name) => {
                if let Some(func) = custom_ops.get(&name) {
                    match func(&data, &path, &value) {
                        Some(v) => {
                            data.insert(path, v);
                        }
                        None => tracing::debug!(%opkey, "custom operator yielded nothing"),
                    }
                }
            }
            _ => unreachable!("only deferred operators reach the post pass"),
        }
    }

    Ok((data, oplog))
}

/// Resolve an operand: mini-patches run through the flat engine themselves,
/// and object elements of array operands do too (so side-effect operators
/// work inside inserted list items).
fn resolve_operand(operand: &Operand, custom_ops: &CustomOps) -> Result<Value, DbError> {
    match operand {
        Operand::Mini(mini) => Ok(Value::Object(apply_mini(mini, custom_ops)?)),
        Operand::Plain(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(match item {
                    Value::Object(map) => Value::Object(apply_mini(map, custom_ops)?),
                    other => other.clone(),
                });
            }
            Ok(Value::Array(out))
        }
        Operand::Plain(other) => Ok(other.clone()),
    }
}

/// Run a mini-patch through the flat engine against an empty document.
fn apply_mini(
    mini: &Map<String, Value>,
    custom_ops: &CustomOps,
) -> Result<Map<String, Value>, DbError> {
    let muts: Vec<(String, Operand)> = mini
        .iter()
        .map(|(k, v)| (k.clone(), Operand::Plain(v.clone())))
        .collect();
    let (doc, _) = apply_flat(&muts, &Map::new(), &[], custom_ops)?;
    Ok(doc)
}

fn operand_items(value: Value, many: bool) -> Vec<Value> {
    if !many {
        return vec![value];
    }
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn int_at(data: &Map<String, Value>, path: &str) -> Result<i64, DbError> {
    match data.get(path) {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
            DbError::TypeMismatch(format!("'{path}' must be an integer"))
        }),
        Some(_) => Err(DbError::TypeMismatch(format!(
            "'{path}' must be an integer"
        ))),
    }
}

fn list_at(data: &Map<String, Value>, path: &str) -> Result<Vec<Value>, DbError> {
    match data.get(path) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(DbError::TypeMismatch(format!("'{path}' must be a list"))),
    }
}

fn measure(value: &Value) -> u64 {
    match value {
        Value::Array(items) => items.len() as u64,
        Value::Object(map) => map.len() as u64,
        Value::String(s) => s.chars().count() as u64,
        _ => 0,
    }
}
