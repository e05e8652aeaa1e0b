//! Field-wise object comparison
//!
//! The diff walks the attribute set of the *desired* object only: fields
//! the live object carries beyond the desired ones (uid, resourceVersion,
//! managedFields, defaulted values) never count as drift. A non-empty
//! desired value that is missing or empty on the live object does.

use serde_json::Value;

/// Whether the live object needs a patch to match the desired one
///
/// Ignores `status` and `kind` at the top level and `selfLink` one level
/// inside `metadata`. Empty desired values (null, `""`, `[]`, `{}`) never
/// force a difference.
pub fn objects_differ(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(desired), Value::Object(live)) => {
            for (key, value) in desired {
                if key == "status" || key == "kind" {
                    continue;
                }
                if is_empty(value) {
                    continue;
                }
                match live.get(key) {
                    None => return true,
                    Some(live_value) if is_empty(live_value) => return true,
                    Some(live_value) => {
                        if value_differs(key, value, live_value) {
                            return true;
                        }
                    }
                }
            }
            false
        }
        _ => desired != live,
    }
}

fn value_differs(key: &str, desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(desired), Value::Object(live)) => {
            let in_metadata = key == "metadata";
            for (key, value) in desired {
                if in_metadata && key == "selfLink" {
                    continue;
                }
                if is_empty(value) {
                    continue;
                }
                match live.get(key) {
                    None => return true,
                    Some(live_value) if is_empty(live_value) => return true,
                    Some(live_value) => {
                        if value_differs(key, value, live_value) {
                            return true;
                        }
                    }
                }
            }
            false
        }
        // Scalars and arrays short-circuit on inequality
        _ => desired != live,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}
