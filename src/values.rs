/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/values.rs
*
* Chart values handling: parsing the tenant's `path=value` overrides into a
* nested document and deep-merging it over the chart's default `values.yaml`.
*
* Override syntax follows `helm --set`: dots in the path create nested maps
* and the value is read as a YAML scalar, so `replicaCount=3` yields a number
* and `service.enabled=true` a boolean. List indexes are not supported.
*
* SPDX-License-Identifier: Apache-2.0
*/

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValuesError {
    #[error("Malformed override '{0}': expected path=value")]
    MalformedOverride(String),

    #[error("Chart default values are not a YAML mapping: {0}")]
    InvalidDefaults(String),

    #[error("Failed to serialize values: {0}")]
    Serialize(String),
}

/// Parses a single scalar the way YAML would. Non-scalar results (a value
/// that happens to look like a flow mapping, say) are kept as the raw string.
fn parse_scalar(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::String(String::new());
    }
    match serde_yaml::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::Null)) => v,
        _ => Value::String(raw.to_string()),
    }
}

/// Turns `["a.b=1", "c=x"]` into `{"a": {"b": 1}, "c": "x"}`.
///
/// Later overrides win over earlier ones for the same path.
pub fn parse_overrides(overrides: &[String]) -> Result<Value, ValuesError> {
    let mut root = Map::new();
    for entry in overrides {
        let (path, raw) = entry
            .split_once('=')
            .ok_or_else(|| ValuesError::MalformedOverride(entry.clone()))?;
        let segments: Vec<&str> = path.trim().split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ValuesError::MalformedOverride(entry.clone()));
        }

        let (leaf, parents) = segments
            .split_last()
            .ok_or_else(|| ValuesError::MalformedOverride(entry.clone()))?;
        let mut cursor = &mut root;
        for segment in parents {
            let slot = cursor
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            cursor = match slot {
                Value::Object(map) => map,
                _ => return Err(ValuesError::MalformedOverride(entry.clone())),
            };
        }
        cursor.insert(leaf.to_string(), parse_scalar(raw));
    }
    Ok(Value::Object(root))
}

/// Deep-merges `overlay` into `base`. Maps merge key by key; anything else in
/// the overlay replaces the base value.
pub fn merge_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Parses chart default values. An empty document is an empty mapping.
pub fn parse_defaults(defaults_yaml: &str) -> Result<Value, ValuesError> {
    if defaults_yaml.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let parsed: Value = serde_yaml::from_str(defaults_yaml)
        .map_err(|e| ValuesError::InvalidDefaults(e.to_string()))?;
    match parsed {
        Value::Null => Ok(Value::Object(Map::new())),
        v @ Value::Object(_) => Ok(v),
        other => Err(ValuesError::InvalidDefaults(format!(
            "top level is {}",
            match other {
                Value::Array(_) => "a list",
                _ => "a scalar",
            }
        ))),
    }
}

/// Chart defaults with the overrides merged on top, overrides winning.
pub fn effective_values(defaults_yaml: &str, overrides: &[String]) -> Result<Value, ValuesError> {
    let mut values = parse_defaults(defaults_yaml)?;
    merge_values(&mut values, &parse_overrides(overrides)?);
    Ok(values)
}

pub fn to_yaml(values: &Value) -> Result<String, ValuesError> {
    serde_yaml::to_string(values).map_err(|e| ValuesError::Serialize(e.to_string()))
}
