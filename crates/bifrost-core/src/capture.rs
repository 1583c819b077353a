//! Captured-value sanitization.
//!
//! Values leaving user code must be JSON-serializable and acyclic before
//! they are persisted as captured variables. The walk keeps an identity set
//! per branch: a revisited container becomes the literal
//! `"[Circular Reference]"`, and a leaf the VM cannot represent as JSON
//! degrades to its type name. Sibling subtrees use copies of the seen-set so
//! shared (but acyclic) substructure does not falsely collide.

use rhai::Dynamic;
use serde_json::{Map, Number, Value};
use std::collections::HashSet;

/// Sentinel stored in place of a revisited container.
pub const CIRCULAR_SENTINEL: &str = "[Circular Reference]";

/// Sanitize a script-VM value into JSON.
pub fn sanitize_dynamic(value: &Dynamic) -> Value {
    sanitize_dynamic_inner(value, &HashSet::new())
}

fn sanitize_dynamic_inner(value: &Dynamic, seen: &HashSet<usize>) -> Value {
    if let Some(array) = value.read_lock::<rhai::Array>() {
        let id = &*array as *const rhai::Array as usize;
        if seen.contains(&id) {
            return Value::String(CIRCULAR_SENTINEL.to_string());
        }
        let mut branch = seen.clone();
        branch.insert(id);
        return Value::Array(
            array
                .iter()
                .map(|item| sanitize_dynamic_inner(item, &branch))
                .collect(),
        );
    }

    if let Some(map) = value.read_lock::<rhai::Map>() {
        let id = &*map as *const rhai::Map as usize;
        if seen.contains(&id) {
            return Value::String(CIRCULAR_SENTINEL.to_string());
        }
        let mut branch = seen.clone();
        branch.insert(id);
        let mut object = Map::new();
        for (key, item) in map.iter() {
            object.insert(key.to_string(), sanitize_dynamic_inner(item, &branch));
        }
        return Value::Object(object);
    }

    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::Number(i.into());
    }
    if let Ok(f) = value.as_float() {
        return Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(f.to_string()));
    }
    if let Some(s) = value.read_lock::<rhai::ImmutableString>() {
        return Value::String(s.to_string());
    }

    // Function pointers, custom host types: not representable as JSON.
    Value::String(format!("<{}>", value.type_name()))
}

/// Sanitize an already-JSON value. JSON trees are acyclic by construction,
/// so this only normalizes non-finite floats (which serde_json rejects).
pub fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        Value::Object(object) => Value::Object(
            object
                .iter()
                .map(|(k, v)| (k.clone(), sanitize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Whether a script-scope binding should appear in captured variables.
/// Excludes private names, declared parameters, the context binding and
/// callables.
pub fn should_capture(name: &str, value: &Dynamic, declared: &HashSet<String>) -> bool {
    if name.starts_with('_') || name == "context" || name == "self" {
        return false;
    }
    if declared.contains(name) {
        return false;
    }
    if value.is::<rhai::FnPtr>() {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::{Engine, Scope};
    use serde_json::json;

    #[test]
    fn test_scalars_sanitize_to_json() {
        assert_eq!(sanitize_dynamic(&Dynamic::from(42_i64)), json!(42));
        assert_eq!(sanitize_dynamic(&Dynamic::from(true)), json!(true));
        assert_eq!(sanitize_dynamic(&Dynamic::from("hi".to_string())), json!("hi"));
        assert_eq!(sanitize_dynamic(&Dynamic::UNIT), Value::Null);
    }

    #[test]
    fn test_nested_containers_sanitize() {
        let engine = Engine::new();
        let value: Dynamic = engine
            .eval(r#"#{"items": [1, 2, 3], "nested": #{"ok": true}}"#)
            .unwrap();
        let sanitized = sanitize_dynamic(&value);
        assert_eq!(sanitized["items"], json!([1, 2, 3]));
        assert_eq!(sanitized["nested"]["ok"], json!(true));
    }

    #[test]
    fn test_shared_cycle_becomes_sentinel() {
        // A closure capturing a variable makes it shared; pushing the shared
        // array into itself builds a true cycle.
        let engine = Engine::new();
        let mut scope = Scope::new();
        engine
            .run_with_scope(
                &mut scope,
                r#"
                    let xs = [1];
                    let grab = || xs.len();
                    xs.push(xs);
                "#,
            )
            .unwrap();
        let xs = scope.get_value::<Dynamic>("xs").unwrap();
        let sanitized = sanitize_dynamic(&xs);
        let items = sanitized.as_array().expect("array");
        assert_eq!(items[0], json!(1));
        assert_eq!(items[1], json!(CIRCULAR_SENTINEL));
    }

    #[test]
    fn test_sibling_subtrees_do_not_collide() {
        // The same (acyclic) map referenced from two branches must be
        // rendered twice, not flagged as circular.
        let engine = Engine::new();
        let value: Dynamic = engine
            .eval(
                r#"
                    let shared_map = #{"ok": true};
                    [shared_map, shared_map]
                "#,
            )
            .unwrap();
        let sanitized = sanitize_dynamic(&value);
        assert_eq!(sanitized[0]["ok"], json!(true));
        assert_eq!(sanitized[1]["ok"], json!(true));
    }

    #[test]
    fn test_function_pointers_are_excluded() {
        let declared = HashSet::new();
        let fn_ptr = Dynamic::from(rhai::FnPtr::new("helper").unwrap());
        assert!(!should_capture("helper", &fn_ptr, &declared));
        assert!(!should_capture("_private", &Dynamic::from(1_i64), &declared));
        assert!(!should_capture("context", &Dynamic::from(1_i64), &declared));
        assert!(should_capture("total", &Dynamic::from(1_i64), &declared));
    }
}
