//! Structural diff, patch and revert over JSON values
//!
//! A diff is a list of [`Change`]s that turns one value into another.
//! Objects are compared key by key; arrays are compared index by index over
//! their common prefix, with the tail reported as added or removed items.
//!
//! For any `a` and `b`:
//!
//! - `patch(&diff(a, b), a) == b`
//! - `revert(&diff(a, b), b) == a`
//! - `diff(a, a)` is empty

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One step of a path into a JSON value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Key(k) => write!(f, ".{k}"),
        }
    }
}

pub type Path = Vec<PathSegment>;

/// A single difference between two values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Change {
    /// Items added to the container at `path`
    Add {
        path: Path,
        items: Vec<(PathSegment, Value)>,
    },
    /// Value at `path` replaced
    Change { path: Path, from: Value, to: Value },
    /// Items removed from the container at `path`
    Remove {
        path: Path,
        items: Vec<(PathSegment, Value)>,
    },
}

impl Change {
    pub fn path(&self) -> &Path {
        match self {
            Self::Add { path, .. } | Self::Change { path, .. } | Self::Remove { path, .. } => path,
        }
    }

    /// The change that undoes this one
    pub fn inverse(&self) -> Self {
        match self.clone() {
            Self::Add { path, items } => Self::Remove { path, items },
            Self::Remove { path, items } => Self::Add { path, items },
            Self::Change { path, from, to } => Self::Change {
                path,
                from: to,
                to: from,
            },
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base: String = self.path().iter().map(ToString::to_string).collect();
        match self {
            Self::Add { items, .. } => {
                for (i, (seg, value)) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "+ {base}{seg}: {value}")?;
                }
                Ok(())
            }
            Self::Remove { items, .. } => {
                for (i, (seg, value)) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "- {base}{seg}: {value}")?;
                }
                Ok(())
            }
            Self::Change { path, from, to } => {
                write!(f, "~ {}: {from} -> {to}", render_path(path))
            }
        }
    }
}

/// Render a path as `.config.hosts[0]`; the root renders as `.`
pub fn render_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    path.iter().map(ToString::to_string).collect()
}

/// Compute the changes that turn `from` into `to`
pub fn diff(from: &Value, to: &Value) -> Vec<Change> {
    let mut changes = Vec::new();
    walk(&mut Vec::new(), from, to, &mut changes);
    changes
}

fn walk(path: &mut Path, from: &Value, to: &Value, out: &mut Vec<Change>) {
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            // serde_json maps iterate in key order
            for (key, av) in a {
                if let Some(bv) = b.get(key) {
                    path.push(PathSegment::Key(key.clone()));
                    walk(path, av, bv, out);
                    path.pop();
                }
            }
            let added: Vec<_> = b
                .iter()
                .filter(|(k, _)| !a.contains_key(*k))
                .map(|(k, v)| (PathSegment::Key(k.clone()), v.clone()))
                .collect();
            if !added.is_empty() {
                out.push(Change::Add {
                    path: path.clone(),
                    items: added,
                });
            }
            let removed: Vec<_> = a
                .iter()
                .filter(|(k, _)| !b.contains_key(*k))
                .map(|(k, v)| (PathSegment::Key(k.clone()), v.clone()))
                .collect();
            if !removed.is_empty() {
                out.push(Change::Remove {
                    path: path.clone(),
                    items: removed,
                });
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            for i in 0..common {
                path.push(PathSegment::Index(i));
                walk(path, &a[i], &b[i], out);
                path.pop();
            }
            if b.len() > common {
                out.push(Change::Add {
                    path: path.clone(),
                    items: tail(b, common),
                });
            }
            if a.len() > common {
                out.push(Change::Remove {
                    path: path.clone(),
                    items: tail(a, common),
                });
            }
        }
        _ if from != to => out.push(Change::Change {
            path: path.clone(),
            from: from.clone(),
            to: to.clone(),
        }),
        _ => {}
    }
}

fn tail(items: &[Value], start: usize) -> Vec<(PathSegment, Value)> {
    items[start..]
        .iter()
        .enumerate()
        .map(|(i, v)| (PathSegment::Index(start + i), v.clone()))
        .collect()
}

/// Apply `changes` to a copy of `value`
pub fn patch(changes: &[Change], value: &Value) -> Result<Value> {
    let mut target = value.clone();
    for change in changes {
        apply(change, &mut target)?;
    }
    Ok(target)
}

/// Undo `changes` on a copy of `value`
pub fn revert(changes: &[Change], value: &Value) -> Result<Value> {
    patch(&swap(changes), value)
}

/// Inverse of a change list, in reverse order
pub fn swap(changes: &[Change]) -> Vec<Change> {
    changes.iter().rev().map(Change::inverse).collect()
}

fn apply(change: &Change, root: &mut Value) -> Result<()> {
    let target = lookup_mut(root, change.path())?;
    match change {
        Change::Change { to, .. } => {
            *target = to.clone();
        }
        Change::Add { items, .. } => match target {
            Value::Object(map) => {
                for (seg, value) in items {
                    let PathSegment::Key(key) = seg else {
                        return Err(Error::patch(format!("index {seg} on an object")));
                    };
                    map.insert(key.clone(), value.clone());
                }
            }
            Value::Array(list) => {
                let mut sorted: Vec<_> = items.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                for (seg, value) in sorted {
                    let PathSegment::Index(i) = seg else {
                        return Err(Error::patch(format!("key {seg} on an array")));
                    };
                    if *i > list.len() {
                        return Err(Error::patch(format!(
                            "insert at {i} past the end of an array of {}",
                            list.len()
                        )));
                    }
                    list.insert(*i, value.clone());
                }
            }
            other => return Err(Error::patch(format!("cannot add items to {other}"))),
        },
        Change::Remove { items, .. } => match target {
            Value::Object(map) => {
                for (seg, _) in items {
                    let PathSegment::Key(key) = seg else {
                        return Err(Error::patch(format!("index {seg} on an object")));
                    };
                    map.remove(key);
                }
            }
            Value::Array(list) => {
                let mut sorted: Vec<_> = items.iter().collect();
                sorted.sort_by(|a, b| b.0.cmp(&a.0));
                for (seg, _) in sorted {
                    let PathSegment::Index(i) = seg else {
                        return Err(Error::patch(format!("key {seg} on an array")));
                    };
                    if *i >= list.len() {
                        return Err(Error::patch(format!(
                            "remove at {i} past the end of an array of {}",
                            list.len()
                        )));
                    }
                    list.remove(*i);
                }
            }
            other => return Err(Error::patch(format!("cannot remove items from {other}"))),
        },
    }
    Ok(())
}

fn lookup_mut<'a>(root: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value> {
    let mut current = root;
    for seg in path {
        current = match (seg, current) {
            (PathSegment::Key(k), Value::Object(map)) => map.get_mut(k),
            (PathSegment::Index(i), Value::Array(list)) => list.get_mut(*i),
            _ => None,
        }
        .ok_or_else(|| Error::patch(format!("path {} does not exist", render_path(path))))?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check_laws(a: &Value, b: &Value) {
        let changes = diff(a, b);
        assert_eq!(&patch(&changes, a).unwrap(), b, "patch {a} -> {b}");
        assert_eq!(&revert(&changes, b).unwrap(), a, "revert {b} -> {a}");
    }

    #[test]
    fn test_identical_values_have_empty_diff() {
        let state = json!({"ip": "10.0.0.1", "hosts": [1, 2], "cfg": {"a": {"b": null}}});
        assert!(diff(&state, &state).is_empty());
        assert_eq!(patch(&diff(&state, &state), &state).unwrap(), state);
    }

    #[test]
    fn test_patch_and_revert_are_inverse() {
        let pairs = [
            (json!({}), json!({"ip": "10.0.0.1"})),
            (json!({"ip": "a", "port": 1}), json!({"ip": "b"})),
            (json!({"hosts": [1, 2, 3]}), json!({"hosts": [1]})),
            (json!({"hosts": [1]}), json!({"hosts": [4, 5, 6]})),
            (json!([["a", "b"], ["c"]]), json!([["a"], ["c", "d"], ["e"]])),
            (json!({"cfg": {"x": [1, {"y": 2}]}}), json!({"cfg": {"x": [1, {"y": 3, "z": 4}]}})),
            (json!({"v": [1, 2]}), json!({"v": {"k": 1}})),
            (json!(null), json!({"a": 1})),
        ];
        for (a, b) in &pairs {
            check_laws(a, b);
            check_laws(b, a);
        }
    }

    #[test]
    fn test_change_shapes() {
        let changes = diff(&json!({"a": 1, "b": [1]}), &json!({"a": 2, "b": [1, 2], "c": 3}));
        assert_eq!(
            changes,
            vec![
                Change::Change {
                    path: vec![PathSegment::Key("a".into())],
                    from: json!(1),
                    to: json!(2)
                },
                Change::Add {
                    path: vec![PathSegment::Key("b".into())],
                    items: vec![(PathSegment::Index(1), json!(2))]
                },
                Change::Add {
                    path: vec![],
                    items: vec![(PathSegment::Key("c".into()), json!(3))]
                },
            ]
        );
    }

    #[test]
    fn test_serialized_form_roundtrips() {
        let changes = diff(&json!({"hosts": ["a"]}), &json!({"hosts": ["a", "b"], "n": 1}));
        let encoded = serde_json::to_value(&changes).unwrap();
        assert_eq!(encoded[0]["op"], "add");
        let decoded: Vec<Change> = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, changes);
    }

    #[test]
    fn test_patch_rejects_mismatched_shape() {
        let changes = diff(&json!({"a": {"b": 1}}), &json!({"a": {"b": 2}}));
        assert!(matches!(
            patch(&changes, &json!({"x": 1})),
            Err(Error::Patch { .. })
        ));
    }

    #[test]
    fn test_display() {
        let changes = diff(&json!({"a": [1]}), &json!({"a": [2]}));
        assert_eq!(changes[0].to_string(), "~ .a[0]: 1 -> 2");
    }
}
