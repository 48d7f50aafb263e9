//! Typed access to a handler's keyword arguments.
//!
//! Arguments reach plugins either as JSON from the server or as XML attribute
//! strings relayed by the agent, so accessors accept both forms where it
//! matters (`"1"`/`"0"` for booleans, space separated lists).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};

use crate::PluginError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Map<String, Value>);

impl From<Map<String, Value>> for Args {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl Args {
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    /// Non-empty string argument. Numbers are accepted as text.
    pub fn string(&self, name: &'static str) -> Result<Option<String>, PluginError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(PluginError::invalid(
                name,
                format!("expected a string, got {}", other),
            )),
        }
    }

    pub fn required_string(&self, name: &'static str) -> Result<String, PluginError> {
        self.string(name)?
            .ok_or(PluginError::MissingArgument(name))
    }

    /// Boolean flag; `"0"`, `"false"` and empty strings are false.
    pub fn flag(&self, name: &'static str) -> Result<bool, PluginError> {
        self.flag_or(name, false)
    }

    /// Like [`Args::flag`], with `default` when the argument is absent.
    pub fn flag_or(&self, name: &'static str, default: bool) -> Result<bool, PluginError> {
        match self.get(name) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::Number(n)) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
            Some(Value::String(s)) => Ok(!matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "" | "0" | "false" | "no" | "off"
            )),
            Some(other) => Err(PluginError::invalid(
                name,
                format!("expected a boolean, got {}", other),
            )),
        }
    }

    /// List argument given as a JSON array or a whitespace separated string.
    pub fn list(&self, name: &'static str) -> Result<Vec<String>, PluginError> {
        match self.get(name) {
            None => Ok(Vec::new()),
            Some(Value::String(s)) => Ok(s.split_whitespace().map(String::from).collect()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(PluginError::invalid(
                        name,
                        format!("expected strings, got {}", other),
                    )),
                })
                .collect(),
            Some(other) => Err(PluginError::invalid(
                name,
                format!("expected a list, got {}", other),
            )),
        }
    }

    /// Object argument given as JSON or as base64 of a JSON object.
    pub fn object(&self, name: &'static str) -> Result<Option<Map<String, Value>>, PluginError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map.clone())),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => {
                let bytes = STANDARD
                    .decode(s.trim())
                    .map_err(|e| PluginError::invalid(name, format!("invalid base64: {}", e)))?;
                match serde_json::from_slice(&bytes) {
                    Ok(Value::Object(map)) => Ok(Some(map)),
                    Ok(_) => Err(PluginError::invalid(name, "expected a JSON object")),
                    Err(e) => Err(PluginError::invalid(name, format!("invalid JSON: {}", e))),
                }
            }
            Some(other) => Err(PluginError::invalid(
                name,
                format!("expected an object, got {}", other),
            )),
        }
    }

    /// Decode a base64 argument into bytes.
    pub fn base64(&self, name: &'static str) -> Result<Option<Vec<u8>>, PluginError> {
        let Some(encoded) = self.string(name)? else {
            return Ok(None);
        };
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        STANDARD
            .decode(compact)
            .map(Some)
            .map_err(|e| PluginError::invalid(name, format!("invalid base64: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Args {
        match value {
            Value::Object(map) => Args::from(map),
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_strings() {
        let a = args(json!({"s": "x", "empty": "", "n": 5, "null": null, "list": []}));
        assert_eq!(a.string("s").unwrap().as_deref(), Some("x"));
        assert_eq!(a.string("empty").unwrap(), None);
        assert_eq!(a.string("null").unwrap(), None);
        assert_eq!(a.string("n").unwrap().as_deref(), Some("5"));
        assert!(a.string("list").is_err());
        assert!(matches!(
            a.required_string("missing"),
            Err(PluginError::MissingArgument("missing"))
        ));
    }

    #[test]
    fn test_flags() {
        let a = args(json!({"t": true, "zero": "0", "one": "1", "f": "false", "n": 0}));
        assert!(a.flag("t").unwrap());
        assert!(!a.flag("zero").unwrap());
        assert!(a.flag("one").unwrap());
        assert!(!a.flag("f").unwrap());
        assert!(!a.flag("n").unwrap());
        assert!(!a.flag("absent").unwrap());
        assert!(a.flag_or("absent", true).unwrap());
        assert!(!a.flag_or("zero", true).unwrap());
    }

    #[test]
    fn test_lists() {
        let a = args(json!({"s": "curl  git", "a": ["vim"], "bad": [1]}));
        assert_eq!(a.list("s").unwrap(), vec!["curl", "git"]);
        assert_eq!(a.list("a").unwrap(), vec!["vim"]);
        assert!(a.list("bad").is_err());
        assert!(a.list("absent").unwrap().is_empty());
    }

    #[test]
    fn test_objects() {
        let encoded = STANDARD.encode(json!({"K": "v"}).to_string());
        let a = args(json!({"o": {"K": "v"}, "b": encoded, "junk": "%%%"}));
        assert_eq!(a.object("o").unwrap(), a.object("b").unwrap());
        assert!(a.object("junk").is_err());
        assert_eq!(a.object("absent").unwrap(), None);
    }
}
