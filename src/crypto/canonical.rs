//! Deterministic canonical JSON serialisation.
//!
//! The canonical form is the ONLY byte representation used as signature
//! input. Mappings are serialised with keys in ascending codepoint order,
//! sequences preserve insertion order, and scalars use minimal JSON forms.
//! Clients in other languages must produce the identical byte stream, so
//! this routine never changes shape without a protocol version bump.

use serde_json::Value;

/// Serialise a JSON value into its canonical string form.
///
/// Equal values always canonicalise to equal strings, regardless of the
/// key order they were parsed with.
#[must_use]
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        // serde_json already renders numbers minimally (no trailing zeros,
        // no positive exponent sign) and strings with standard JSON escapes.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into()));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_else(|_| "\"\"".into()));
                out.push(':');
                if let Some(v) = map.get(key.as_str()) {
                    write_value(out, v);
                }
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_keys_sorted_by_codepoint() {
        let v = json!({"b": 2, "a": 1, "Z": 0});
        assert_eq!(canonicalize(&v), r#"{"Z":0,"a":1,"b":2}"#);
    }

    #[test]
    fn nested_structures_canonicalised_recursively() {
        let v = json!({"outer": {"y": [3, 2], "x": null}});
        assert_eq!(canonicalize(&v), r#"{"outer":{"x":null,"y":[3,2]}}"#);
    }

    #[test]
    fn key_order_is_irrelevant() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let v = json!({"k": ["x", {"b": true, "a": 1.5}]});
        let once = canonicalize(&v);
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        assert_eq!(canonicalize(&reparsed), once);
    }

    #[test]
    fn strings_escaped_per_json() {
        let v = json!({"s": "line\n\"quote\""});
        assert_eq!(canonicalize(&v), r#"{"s":"line\n\"quote\""}"#);
    }
}
