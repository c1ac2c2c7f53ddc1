// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dot-separated path access into JSON values. Numeric segments index
//! arrays; `set` creates intermediate objects as needed.

use serde_json::{Map, Value};

/// Read the value at `path`.
#[must_use]
pub fn get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Remove and return the value at `path`. Empty intermediate objects left
/// behind by the removal are kept (the shape of the document is part of
/// the payload).
pub fn remove(value: &mut Value, path: &str) -> Option<Value> {
    let (parent_path, last) = match path.rsplit_once('.') {
        Some((p, l)) => (Some(p), l),
        None => (None, path),
    };
    let parent = match parent_path {
        Some(p) => get_mut(value, p)?,
        None => value,
    };
    match parent {
        Value::Object(map) => map.remove(last),
        Value::Array(items) => {
            let idx = last.parse::<usize>().ok()?;
            (idx < items.len()).then(|| items.remove(idx))
        }
        _ => None,
    }
}

/// Write `new` at `path`, creating intermediate objects for missing
/// segments. Writing through a scalar replaces it with an object.
pub fn set(value: &mut Value, path: &str, new: Value) {
    let mut current = value;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        if last {
            match current {
                Value::Object(map) => {
                    map.insert((*segment).to_owned(), new);
                }
                Value::Array(items) => {
                    if let Ok(idx) = segment.parse::<usize>() {
                        if idx < items.len() {
                            items[idx] = new;
                        } else {
                            items.push(new);
                        }
                    }
                }
                other => {
                    let mut map = Map::new();
                    map.insert((*segment).to_owned(), new);
                    *other = Value::Object(map);
                }
            }
            return;
        }
        let needs_object = !matches!(current, Value::Object(_) | Value::Array(_));
        if needs_object {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry((*segment).to_owned())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => {
                let idx = segment.parse::<usize>().unwrap_or(items.len());
                if idx >= items.len() {
                    items.push(Value::Object(Map::new()));
                    items.last_mut().expect("just pushed")
                } else {
                    &mut items[idx]
                }
            }
            _ => unreachable!("coerced to object above"),
        };
    }
}

fn get_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => {
                let idx = segment.parse::<usize>().ok()?;
                items.get_mut(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Every leaf path of `value` in lexicographic order. Scalars and empty
/// containers are leaves; the root scalar has the empty path.
#[must_use]
pub fn leaf_paths(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_leaves(value, String::new(), &mut out);
    out.sort();
    out
}

fn collect_leaves(value: &Value, prefix: String, out: &mut Vec<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                collect_leaves(v, path, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, v) in items.iter().enumerate() {
                let path = if prefix.is_empty() {
                    i.to_string()
                } else {
                    format!("{prefix}.{i}")
                };
                collect_leaves(v, path, out);
            }
        }
        _ => out.push(prefix),
    }
}
