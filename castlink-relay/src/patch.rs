//! Structural diff and patch over JSON documents.
//!
//! Replicated state is shipped as a list of operations, each addressing a
//! node by its path from the document root:
//!
//! ```text
//! before: {"a": 1, "list": [1, 2, 3]}
//! after:  {"a": 2, "list": [1, 2], "b": true}
//!
//! [{"op":"replace","path":["a"],"value":2},
//!  {"op":"remove","path":["list",2]},
//!  {"op":"add","path":["b"],"value":true}]
//! ```
//!
//! Objects are diffed key by key, arrays index by index over their common
//! prefix, anything else is replaced whole. An empty path addresses the root.
//! `apply(before, diff(before, after)) == after` for every pair of documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// One step of a path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathKey {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKey::Index(i) => write!(f, "{i}"),
            PathKey::Key(k) => f.write_str(k),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Replace,
    Remove,
}

/// A single patch operation.
///
/// `value` is omitted on the wire when it is `null` (always for `remove`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op: OpKind,
    pub path: Vec<PathKey>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

impl Operation {
    pub fn add(path: Vec<PathKey>, value: Value) -> Self {
        Self { op: OpKind::Add, path, value }
    }

    pub fn replace(path: Vec<PathKey>, value: Value) -> Self {
        Self { op: OpKind::Replace, path, value }
    }

    pub fn remove(path: Vec<PathKey>) -> Self {
        Self { op: OpKind::Remove, path, value: Value::Null }
    }
}

/// Patch application errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("path not found: {0}")]
    MissingPath(String),
    #[error("index out of bounds at {0}")]
    IndexOutOfBounds(String),
    #[error("path {0} does not match the document shape")]
    TypeMismatch(String),
}

/// Render a path as `/a/0/b` for error messages and logs.
pub fn display_path(path: &[PathKey]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter().map(|key| format!("/{key}")).collect()
}

/// Compute the operations that turn `before` into `after`.
pub fn diff(before: &Value, after: &Value) -> Vec<Operation> {
    let mut ops = Vec::new();
    let mut path = Vec::new();
    diff_into(before, after, &mut path, &mut ops);
    ops
}

fn diff_into(before: &Value, after: &Value, path: &mut Vec<PathKey>, ops: &mut Vec<Operation>) {
    if before == after {
        return;
    }
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => diff_objects(old, new, path, ops),
        (Value::Array(old), Value::Array(new)) => {
            let common = old.len().min(new.len());
            for i in 0..common {
                path.push(PathKey::Index(i));
                diff_into(&old[i], &new[i], path, ops);
                path.pop();
            }
            for (i, item) in new.iter().enumerate().skip(common) {
                ops.push(Operation::add(child(path, PathKey::Index(i)), item.clone()));
            }
            // Highest index first so earlier removals do not shift later ones.
            for i in (common..old.len()).rev() {
                ops.push(Operation::remove(child(path, PathKey::Index(i))));
            }
        }
        _ => ops.push(Operation::replace(path.clone(), after.clone())),
    }
}

fn diff_objects(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    path: &mut Vec<PathKey>,
    ops: &mut Vec<Operation>,
) {
    for (key, old_value) in old {
        match new.get(key) {
            Some(new_value) => {
                path.push(PathKey::Key(key.clone()));
                diff_into(old_value, new_value, path, ops);
                path.pop();
            }
            None => ops.push(Operation::remove(child(path, PathKey::Key(key.clone())))),
        }
    }
    for (key, new_value) in new {
        if !old.contains_key(key) {
            ops.push(Operation::add(
                child(path, PathKey::Key(key.clone())),
                new_value.clone(),
            ));
        }
    }
}

fn child(path: &[PathKey], key: PathKey) -> Vec<PathKey> {
    let mut full = Vec::with_capacity(path.len() + 1);
    full.extend_from_slice(path);
    full.push(key);
    full
}

/// Apply `ops` to `doc` in order.
///
/// On error `doc` may hold a partially patched value; callers that publish
/// the document apply to a copy and commit only on success.
pub fn apply(doc: &mut Value, ops: &[Operation]) -> Result<(), PatchError> {
    for op in ops {
        apply_one(doc, op)?;
    }
    Ok(())
}

fn apply_one(doc: &mut Value, op: &Operation) -> Result<(), PatchError> {
    let Some((last, parent_path)) = op.path.split_last() else {
        *doc = match op.op {
            OpKind::Remove => Value::Null,
            OpKind::Add | OpKind::Replace => op.value.clone(),
        };
        return Ok(());
    };

    let parent = resolve_mut(doc, parent_path)?;
    match (parent, last) {
        (Value::Object(map), PathKey::Key(key)) => match op.op {
            OpKind::Add => {
                map.insert(key.clone(), op.value.clone());
                Ok(())
            }
            OpKind::Replace => match map.get_mut(key) {
                Some(slot) => {
                    *slot = op.value.clone();
                    Ok(())
                }
                None => Err(PatchError::MissingPath(display_path(&op.path))),
            },
            OpKind::Remove => map
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| PatchError::MissingPath(display_path(&op.path))),
        },
        (Value::Array(items), PathKey::Index(index)) => {
            let index = *index;
            match op.op {
                OpKind::Add if index <= items.len() => {
                    items.insert(index, op.value.clone());
                    Ok(())
                }
                OpKind::Replace if index < items.len() => {
                    items[index] = op.value.clone();
                    Ok(())
                }
                OpKind::Remove if index < items.len() => {
                    items.remove(index);
                    Ok(())
                }
                _ => Err(PatchError::IndexOutOfBounds(display_path(&op.path))),
            }
        }
        _ => Err(PatchError::TypeMismatch(display_path(&op.path))),
    }
}

fn resolve_mut<'a>(doc: &'a mut Value, path: &[PathKey]) -> Result<&'a mut Value, PatchError> {
    let mut node = doc;
    for (depth, key) in path.iter().enumerate() {
        let next = match (node, key) {
            (Value::Object(map), PathKey::Key(k)) => map.get_mut(k),
            (Value::Array(items), PathKey::Index(i)) => items.get_mut(*i),
            _ => return Err(PatchError::TypeMismatch(display_path(&path[..=depth]))),
        };
        node = next.ok_or_else(|| PatchError::MissingPath(display_path(&path[..=depth])))?;
    }
    Ok(node)
}
