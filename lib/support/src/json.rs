use serde_json::Value;

/// Recursive key-wise overlay of `incoming` onto `existing`.
///
/// Two mappings merge per key; every other combination is replaced by
/// `incoming` wholesale, arrays included. Keys absent from `incoming` keep
/// their existing value, which is what lets devices send partial updates.
pub fn deep_merge(existing: &Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Object(prior), Value::Object(update)) => {
            let mut merged = prior.clone();
            for (field, value) in update {
                let next = match prior.get(field) {
                    Some(prev) => deep_merge(prev, value),
                    None => value.clone(),
                };
                merged.insert(field.clone(), next);
            }
            Value::Object(merged)
        }
        (_, incoming) => incoming.clone(),
    }
}

/// Structural equality independent of map iteration order.
///
/// Numbers compare by numeric value, so `1` and `1.0` are equal. This is the
/// comparison that decides whether a write bumps an object revision.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(v, w)| values_equal(v, w))
        }
        _ => a == b,
    }
}

fn numbers_equal(x: &serde_json::Number, y: &serde_json::Number) -> bool {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a == b;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    #[test]
    fn merge_overlays_nested_mappings() {
        let existing = json!({"a": {"b": 1, "c": 2}, "d": 3});
        let incoming = json!({"a": {"b": 9}});

        assert_json_eq!(
            deep_merge(&existing, &incoming),
            json!({"a": {"b": 9, "c": 2}, "d": 3})
        );
    }

    #[test]
    fn merge_keeps_fields_the_update_omits() {
        let existing = json!({"away": false, "fan_timer_duration": 900, "postal_code": "94107"});
        let incoming = json!({"away": true});

        assert_json_eq!(
            deep_merge(&existing, &incoming),
            json!({"away": true, "fan_timer_duration": 900, "postal_code": "94107"})
        );
    }

    #[test]
    fn merge_replaces_arrays_atomically() {
        let existing = json!({"days": [1, 2, 3], "name": "x"});
        let incoming = json!({"days": [4]});

        assert_json_eq!(deep_merge(&existing, &incoming), json!({"days": [4], "name": "x"}));
    }

    #[test]
    fn merge_replaces_scalar_with_mapping_and_back() {
        assert_json_eq!(deep_merge(&json!(5), &json!({"a": 1})), json!({"a": 1}));
        assert_json_eq!(deep_merge(&json!({"a": 1}), &json!(5)), json!(5));
    }

    #[test]
    fn explicit_null_replaces() {
        let merged = deep_merge(&json!({"a": 1, "b": 2}), &json!({"a": null}));
        assert_json_eq!(merged, json!({"a": null, "b": 2}));
    }

    #[test]
    fn equality_ignores_key_order() {
        let a = serde_json::from_str::<Value>(r#"{"x": 1, "y": {"p": true, "q": "s"}}"#).unwrap();
        let b = serde_json::from_str::<Value>(r#"{"y": {"q": "s", "p": true}, "x": 1}"#).unwrap();
        assert!(values_equal(&a, &b));
    }

    #[test]
    fn equality_treats_integer_and_float_forms_alike() {
        assert!(values_equal(&json!({"t": 20}), &json!({"t": 20.0})));
        assert!(!values_equal(&json!({"t": 20}), &json!({"t": 20.5})));
    }

    #[test]
    fn equality_detects_missing_and_extra_keys() {
        assert!(!values_equal(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(!values_equal(&json!({"a": 1, "b": 2}), &json!({"a": 1})));
    }

    #[test]
    fn merge_then_compare_detects_noop() {
        let existing = json!({"away": true, "fan_mode": "auto"});
        let incoming = json!({"away": true});
        let merged = deep_merge(&existing, &incoming);
        assert!(values_equal(&existing, &merged));
    }
}
