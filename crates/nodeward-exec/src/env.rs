//! Environment payloads attached to commands.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::debug;
use serde_json::Value;
use std::collections::HashMap;

/// Decode a base64-encoded JSON object into an environment map.
///
/// Every value is coerced to text; `null` and falsy values (`false`, `0`, empty
/// string/array/object) become the empty string. Returns `None` for a missing
/// payload and for any decoding error.
pub fn decode_env_payload(payload: Option<&str>) -> Option<HashMap<String, String>> {
    let payload = payload?.trim();
    if payload.is_empty() {
        return None;
    }

    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = match STANDARD.decode(compact) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Ignoring environment payload: invalid base64: {}", e);
            return None;
        }
    };

    let object = match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(object)) => object,
        Ok(other) => {
            debug!("Ignoring environment payload: expected object, got {}", other);
            return None;
        }
        Err(e) => {
            debug!("Ignoring environment payload: invalid JSON: {}", e);
            return None;
        }
    };

    Some(
        object
            .into_iter()
            .map(|(name, value)| (name, value_to_text(value)))
            .collect(),
    )
}

/// Text form of a JSON value as used in environment variables.
pub fn value_to_text(value: Value) -> String {
    match value {
        Value::Null | Value::Bool(false) => String::new(),
        Value::String(s) => s,
        Value::Number(n) if n.as_f64() == Some(0.0) => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Array(a) if a.is_empty() => String::new(),
        Value::Object(o) if o.is_empty() => String::new(),
        other => other.to_string(),
    }
}

/// The agent's own environment with `overrides` layered on top.
pub fn merged_environment(overrides: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}
