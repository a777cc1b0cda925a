use serde_json::Value;
use sha2::{Digest, Sha256};

/// Derive the stable event identifier for an event that arrived without one:
/// SHA-256 over the canonical serialization of the raw `data` value, emitted
/// as lowercase hex. Canonical form sorts object keys lexicographically at
/// every depth and carries no insignificant whitespace, so the same data
/// always yields the same identifier across processes and runs.
pub fn synthesize_aid(data: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(data, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json escapes the key for us
                out.push_str(&serde_json::to_string(key).unwrap());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already have a single compact serialization
        _ => out.push_str(&value.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn deterministic_across_key_order() {
        let a = json!({"type": "Coupe", "hp": 400, "year": 2020, "topSpeed": 280});
        let b = json!({"topSpeed": 280, "year": 2020, "hp": 400, "type": "Coupe"});

        assert_eq!(synthesize_aid(&a), synthesize_aid(&b));
    }

    #[test]
    fn sorts_nested_objects() {
        let a = json!({"outer": {"b": 1, "a": [{"z": 1, "y": 2}]}});
        let b = json!({"outer": {"a": [{"y": 2, "z": 1}], "b": 1}});

        assert_eq!(synthesize_aid(&a), synthesize_aid(&b));
    }

    #[test]
    fn distinct_data_distinct_fingerprint() {
        let a = json!({"type": "Coupe", "hp": 400});
        let b = json!({"type": "Coupe", "hp": 401});
        let c = json!({"type": "Coupe"});

        assert_ne!(synthesize_aid(&a), synthesize_aid(&b));
        assert_ne!(synthesize_aid(&a), synthesize_aid(&c));
    }

    #[test]
    fn emits_lowercase_hex() {
        let aid = synthesize_aid(&json!({"type": "Van"}));

        assert_eq!(aid.len(), 64);
        assert!(aid.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn known_digest() {
        // sha256 of the canonical string {"hp":400,"type":"Coupe"}
        let aid = synthesize_aid(&json!({"type": "Coupe", "hp": 400}));
        let mut hasher = Sha256::new();
        hasher.update(br#"{"hp":400,"type":"Coupe"}"#);
        assert_eq!(aid, format!("{:x}", hasher.finalize()));
    }
}
