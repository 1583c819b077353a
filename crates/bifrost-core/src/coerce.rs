//! Declared-type coercion of incoming parameters.
//!
//! Query and form transports deliver everything as strings; declared
//! metadata says what the handler actually expects. Coercion failures keep
//! the raw value and produce a warning instead of failing the execution.

use bifrost_workflow::metadata::{ParameterDef, ParameterType};
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// Truthy string forms for declared bool parameters.
const TRUE_STRINGS: [&str; 4] = ["true", "1", "yes", "on"];

/// Coerce string parameters to their declared types. Returns the coerced
/// map and warnings for values that could not be converted.
pub fn coerce_parameters(
    defs: &[ParameterDef],
    mut parameters: BTreeMap<String, Value>,
) -> (BTreeMap<String, Value>, Vec<String>) {
    let mut warnings = Vec::new();

    for def in defs {
        let Some(value) = parameters.get(&def.name) else {
            continue;
        };
        let Value::String(raw) = value else {
            continue;
        };

        match def.param_type {
            ParameterType::Int => match raw.trim().parse::<i64>() {
                Ok(parsed) => {
                    parameters.insert(def.name.clone(), Value::Number(parsed.into()));
                }
                Err(_) => warnings.push(format!(
                    "Parameter '{}' could not be coerced to int, keeping raw value '{raw}'",
                    def.name
                )),
            },
            ParameterType::Float => match raw.trim().parse::<f64>() {
                Ok(parsed) => match Number::from_f64(parsed) {
                    Some(number) => {
                        parameters.insert(def.name.clone(), Value::Number(number));
                    }
                    None => warnings.push(format!(
                        "Parameter '{}' could not be coerced to float, keeping raw value '{raw}'",
                        def.name
                    )),
                },
                Err(_) => warnings.push(format!(
                    "Parameter '{}' could not be coerced to float, keeping raw value '{raw}'",
                    def.name
                )),
            },
            ParameterType::Bool => {
                let truthy = TRUE_STRINGS.contains(&raw.trim().to_ascii_lowercase().as_str());
                parameters.insert(def.name.clone(), Value::Bool(truthy));
            }
            _ => {}
        }
    }

    (parameters, warnings)
}

/// Split incoming parameters into declared (passed to the handler by name)
/// and extra (carried on the execution context). When metadata declares no
/// parameters the handler receives the full map.
pub fn split_parameters(
    defs: &[ParameterDef],
    parameters: BTreeMap<String, Value>,
) -> (BTreeMap<String, Value>, BTreeMap<String, Value>) {
    if defs.is_empty() {
        return (parameters, BTreeMap::new());
    }

    let declared_names: std::collections::HashSet<&str> =
        defs.iter().map(|d| d.name.as_str()).collect();

    let mut declared = BTreeMap::new();
    let mut extra = BTreeMap::new();
    for (name, value) in parameters {
        if declared_names.contains(name.as_str()) {
            declared.insert(name, value);
        } else {
            extra.insert(name, value);
        }
    }
    (declared, extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defs() -> Vec<ParameterDef> {
        vec![
            ParameterDef::new("count", ParameterType::Int),
            ParameterDef::new("ratio", ParameterType::Float),
            ParameterDef::new("enabled", ParameterType::Bool),
            ParameterDef::new("label", ParameterType::String),
        ]
    }

    #[test]
    fn test_int_coercion() {
        let params = BTreeMap::from([("count".to_string(), json!("42"))]);
        let (coerced, warnings) = coerce_parameters(&defs(), params);
        assert_eq!(coerced["count"], json!(42));
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_bool_truthy_table() {
        for raw in ["true", "1", "yes", "on", "TRUE", "Yes"] {
            let params = BTreeMap::from([("enabled".to_string(), json!(raw))]);
            let (coerced, _) = coerce_parameters(&defs(), params);
            assert_eq!(coerced["enabled"], json!(true), "raw = {raw}");
        }
        for raw in ["false", "0", "no", "off", "anything"] {
            let params = BTreeMap::from([("enabled".to_string(), json!(raw))]);
            let (coerced, _) = coerce_parameters(&defs(), params);
            assert_eq!(coerced["enabled"], json!(false), "raw = {raw}");
        }
    }

    #[test]
    fn test_failed_numeric_coercion_keeps_raw_and_warns() {
        let params = BTreeMap::from([("count".to_string(), json!("not-a-number"))]);
        let (coerced, warnings) = coerce_parameters(&defs(), params);
        assert_eq!(coerced["count"], json!("not-a-number"));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("count"));
    }

    #[test]
    fn test_non_string_values_pass_through() {
        let params = BTreeMap::from([("count".to_string(), json!(7))]);
        let (coerced, warnings) = coerce_parameters(&defs(), params);
        assert_eq!(coerced["count"], json!(7));
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_split_separates_extras() {
        let params = BTreeMap::from([
            ("count".to_string(), json!(1)),
            ("ticket".to_string(), json!("T-9")),
        ]);
        let (declared, extra) = split_parameters(&defs(), params);
        assert!(declared.contains_key("count"));
        assert!(extra.contains_key("ticket"));
    }

    #[test]
    fn test_empty_declaration_forwards_everything() {
        let params = BTreeMap::from([("anything".to_string(), json!(1))]);
        let (declared, extra) = split_parameters(&[], params);
        assert!(declared.contains_key("anything"));
        assert!(extra.is_empty());
    }
}
