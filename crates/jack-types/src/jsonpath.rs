//! Dotted-path resolution over `serde_json::Value`, and line/column-annotated
//! parse errors for malformed JSON config files.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{message} at line {line} column {column}")]
pub struct JsonLocationError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

/// Parse `text` as JSON, translating `serde_json`'s byte offset into a
/// 1-based line/column pair on failure. `serde_json::Error` already reports
/// line/column for syntax errors, but we recompute from the raw text so the
/// message format is stable across serde_json versions and covers the case
/// where the error carries only a byte offset.
pub fn parse_with_location(text: &str) -> Result<Value, JsonLocationError> {
    serde_json::from_str(text).map_err(|e| {
        let line = e.line();
        let column = e.column();
        if line > 0 {
            JsonLocationError {
                message: e.to_string(),
                line,
                column,
            }
        } else {
            locate(text, &e)
        }
    })
}

fn locate(text: &str, err: &serde_json::Error) -> JsonLocationError {
    // Fallback path: serde_json always reports line/column, but keep a
    // from-scratch scan so this function has a single well-tested behavior
    // even if that guarantee ever changes upstream.
    let mut line = 1usize;
    let mut col = 1usize;
    for ch in text.chars() {
        if line == err.line() && col == err.column() {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    JsonLocationError {
        message: err.to_string(),
        line,
        column: col,
    }
}

/// Split `"a.b.c"` into `["a", "b", "c"]`. An empty path yields an empty Vec
/// (meaning "the whole document").
pub fn split_path(path: &str) -> Vec<&str> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').collect()
    }
}

/// Walk `root` along `segments`, returning a reference to the located value.
pub fn get_path<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut cur = root;
    for seg in segments {
        cur = match cur {
            Value::Object(map) => map.get(*seg)?,
            Value::Array(arr) => arr.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Walk `root` along `segments`, creating intermediate objects as needed, and
/// set the final segment to `value`. Returns an error if a non-final segment
/// resolves to a non-object value.
pub fn set_path(root: &mut Value, segments: &[&str], value: Value) -> Result<(), String> {
    if segments.is_empty() {
        *root = value;
        return Ok(());
    }
    if !root.is_object() {
        *root = Value::Object(serde_json::Map::new());
    }
    let mut cur = root;
    for seg in &segments[..segments.len() - 1] {
        let map = cur
            .as_object_mut()
            .ok_or_else(|| format!("path segment '{seg}' is not an object"))?;
        cur = map
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !cur.is_object() {
            *cur = Value::Object(serde_json::Map::new());
        }
    }
    let last = segments[segments.len() - 1];
    let map = cur
        .as_object_mut()
        .ok_or_else(|| format!("path segment '{last}' is not an object"))?;
    map.insert(last.to_string(), value);
    Ok(())
}

/// Canonical JSON: key-sorted, no insignificant whitespace. Two values are
/// "canonical-JSON equal" iff their canonical renderings are byte-identical.
pub fn canonicalize(value: &Value) -> String {
    let sorted = sort_keys(value);
    serde_json::to_string(&sorted).expect("Value always serializes")
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), sort_keys(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

pub fn canonical_eq(a: &Value, b: &Value) -> bool {
    canonicalize(a) == canonicalize(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_eq_ignores_key_order_and_whitespace() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 1}});
        let b = serde_json::from_str(r#"{ "a" : { "x": 1, "y": 2 }, "b": 1 }"#).unwrap();
        assert!(canonical_eq(&a, &b));
    }

    #[test]
    fn canonical_eq_detects_difference() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert!(!canonical_eq(&a, &b));
    }

    #[test]
    fn get_path_walks_nested_object() {
        let v = json!({"interfaces": {"eth0": {"mtu": 1500}}});
        let segs = split_path("interfaces.eth0.mtu");
        assert_eq!(get_path(&v, &segs), Some(&json!(1500)));
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut v = json!({});
        set_path(&mut v, &split_path("interfaces.eth0.mtu"), json!(9000)).unwrap();
        assert_eq!(v["interfaces"]["eth0"]["mtu"], json!(9000));
    }

    #[test]
    fn parse_with_location_reports_line_and_column() {
        let text = "{\n  \"a\": ,\n}";
        let err = parse_with_location(text).unwrap_err();
        assert_eq!(err.line, 2);
    }
}
