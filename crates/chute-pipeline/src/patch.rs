//! JSON patch (RFC 6902) over `serde_json::Value`, used for host config edits.
//!
//! Paths are JSON pointers (RFC 6901). A patch applies atomically: it is
//! applied to a copy and only returned if every operation succeeds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

/// Apply `ops` to a copy of `doc`.
pub fn apply(doc: &Value, ops: &[PatchOp]) -> Result<Value> {
    let mut out = doc.clone();
    for (index, op) in ops.iter().enumerate() {
        apply_one(&mut out, op)
            .map_err(|e| PipelineError::Validation(format!("patch operation {index}: {e}")))?;
    }
    Ok(out)
}

fn apply_one(doc: &mut Value, op: &PatchOp) -> std::result::Result<(), String> {
    match op {
        PatchOp::Add { path, value } => add(doc, path, value.clone()),
        PatchOp::Remove { path } => remove(doc, path).map(|_| ()),
        PatchOp::Replace { path, value } => {
            let target = doc
                .pointer_mut(path)
                .ok_or_else(|| format!("no value at {path}"))?;
            *target = value.clone();
            Ok(())
        }
        PatchOp::Move { from, path } => {
            if path.starts_with(&format!("{from}/")) {
                return Err(format!("cannot move {from} into its own child {path}"));
            }
            let value = remove(doc, from)?;
            add(doc, path, value)
        }
        PatchOp::Copy { from, path } => {
            let value = doc
                .pointer(from)
                .cloned()
                .ok_or_else(|| format!("no value at {from}"))?;
            add(doc, path, value)
        }
        PatchOp::Test { path, value } => match doc.pointer(path) {
            Some(found) if found == value => Ok(()),
            Some(found) => Err(format!("test failed at {path}: found {found}")),
            None => Err(format!("test failed: no value at {path}")),
        },
    }
}

fn split_parent(path: &str) -> std::result::Result<(&str, String), String> {
    if path.is_empty() {
        return Err("the document root cannot be the target".to_string());
    }
    let idx = path
        .rfind('/')
        .ok_or_else(|| format!("invalid pointer {path:?}"))?;
    let last = path[idx + 1..].replace("~1", "/").replace("~0", "~");
    Ok((&path[..idx], last))
}

fn add(doc: &mut Value, path: &str, value: Value) -> std::result::Result<(), String> {
    let (parent_path, key) = split_parent(path)?;
    let parent = doc
        .pointer_mut(parent_path)
        .ok_or_else(|| format!("no parent for {path}"))?;
    match parent {
        Value::Object(map) => {
            map.insert(key, value);
            Ok(())
        }
        Value::Array(items) => {
            let index = if key == "-" {
                items.len()
            } else {
                key.parse::<usize>()
                    .map_err(|_| format!("bad array index {key:?}"))?
            };
            if index > items.len() {
                return Err(format!("index {index} out of bounds"));
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(format!("parent of {path} is not a container")),
    }
}

fn remove(doc: &mut Value, path: &str) -> std::result::Result<Value, String> {
    let (parent_path, key) = split_parent(path)?;
    let parent = doc
        .pointer_mut(parent_path)
        .ok_or_else(|| format!("no parent for {path}"))?;
    match parent {
        Value::Object(map) => map.remove(&key).ok_or_else(|| format!("no value at {path}")),
        Value::Array(items) => {
            let index = key
                .parse::<usize>()
                .map_err(|_| format!("bad array index {key:?}"))?;
            if index >= items.len() {
                return Err(format!("index {index} out of bounds"));
            }
            Ok(items.remove(index))
        }
        _ => Err(format!("parent of {path} is not a container")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ops(v: Value) -> Vec<PatchOp> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn replace_nested_value() {
        let doc = json!({"zerotier": {"enabled": false, "networks": []}});
        let out = apply(
            &doc,
            &ops(json!([{"op": "replace", "path": "/zerotier/enabled", "value": true}])),
        )
        .unwrap();
        assert_eq!(out["zerotier"]["enabled"], json!(true));
        assert_eq!(doc["zerotier"]["enabled"], json!(false));
    }

    #[test]
    fn add_append_and_remove() {
        let doc = json!({"wifi": [{"id": "wlan0"}]});
        let out = apply(
            &doc,
            &ops(json!([
                {"op": "add", "path": "/wifi/-", "value": {"id": "wlan1"}},
                {"op": "add", "path": "/wifi/0", "value": {"id": "wlan2"}},
                {"op": "remove", "path": "/wifi/1"}
            ])),
        )
        .unwrap();
        assert_eq!(out["wifi"], json!([{"id": "wlan2"}, {"id": "wlan1"}]));
    }

    #[test]
    fn move_copy_and_test() {
        let doc = json!({"a": {"x": 1}, "b": {}});
        let out = apply(
            &doc,
            &ops(json!([
                {"op": "test", "path": "/a/x", "value": 1},
                {"op": "copy", "from": "/a/x", "path": "/b/y"},
                {"op": "move", "from": "/a", "path": "/c"}
            ])),
        )
        .unwrap();
        assert_eq!(out, json!({"b": {"y": 1}, "c": {"x": 1}}));
    }

    #[test]
    fn failure_is_validation_and_atomic() {
        let doc = json!({"a": 1});
        let err = apply(
            &doc,
            &ops(json!([
                {"op": "replace", "path": "/a", "value": 2},
                {"op": "replace", "path": "/missing/b", "value": 3}
            ])),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationRejection);
        assert_eq!(doc, json!({"a": 1}));
    }

    #[test]
    fn escaped_pointer_keys() {
        let doc = json!({"m": {}});
        let out = apply(
            &doc,
            &ops(json!([{"op": "add", "path": "/m/a~1b", "value": 1}])),
        )
        .unwrap();
        assert_eq!(out["m"]["a/b"], json!(1));
    }
}
