//! Command invocation envelope.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation identifiers are decimal numbers below 10^31.
const CORRELATION_ID_BOUND: u128 = 10_u128.pow(31);

/// One request to execute a named command on this node.
///
/// Immutable once dispatched: the dispatcher only ever borrows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInvocation {
    /// Correlation ID for response matching.
    pub id: String,

    /// Dotted command name, e.g. `script.run`.
    pub name: String,

    /// Keyword arguments for the handler.
    #[serde(default)]
    pub args: Map<String, Value>,

    /// Address the response should be sent to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl CommandInvocation {
    /// Create an invocation, generating a correlation ID when none was supplied.
    pub fn new(name: impl Into<String>, args: Map<String, Value>, id: Option<String>) -> Self {
        let id = id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_correlation_id);
        Self {
            id,
            name: name.into(),
            args,
            reply_to: None,
        }
    }

    /// Set the address responses are routed to.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Handler name inside a plugin (`script.run` -> `script_run`).
    pub fn handler_name(&self) -> String {
        self.name.replace('.', "_")
    }

    /// First segment of the command name, which selects the plugin executable.
    pub fn plugin_name(&self) -> &str {
        self.name.split('.').next().unwrap_or_default()
    }

    /// Serialize the arguments as the JSON object a plugin reads on stdin.
    pub fn args_json(&self) -> String {
        Value::Object(self.args.clone()).to_string()
    }
}

/// Generate a fresh correlation ID as a large random decimal string.
pub fn new_correlation_id() -> String {
    rand::rng().random_range(0..CORRELATION_ID_BOUND).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_id_when_absent() {
        let inv = CommandInvocation::new("script.run", Map::new(), None);
        assert!(!inv.id.is_empty());
        assert!(inv.id.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_empty_id_is_replaced() {
        let inv = CommandInvocation::new("script.run", Map::new(), Some(String::new()));
        assert!(!inv.id.is_empty());
    }

    #[test]
    fn test_supplied_id_is_kept() {
        let inv = CommandInvocation::new("script.run", Map::new(), Some("42".into()));
        assert_eq!(inv.id, "42");
    }

    #[test]
    fn test_handler_and_plugin_names() {
        let inv = CommandInvocation::new("puppet.apply", Map::new(), None);
        assert_eq!(inv.handler_name(), "puppet_apply");
        assert_eq!(inv.plugin_name(), "puppet");

        let bare = CommandInvocation::new("ping", Map::new(), None);
        assert_eq!(bare.handler_name(), "ping");
        assert_eq!(bare.plugin_name(), "ping");
    }

    #[test]
    fn test_args_json_is_object() {
        let mut args = Map::new();
        args.insert("command".into(), json!("echo hi"));
        let inv = CommandInvocation::new("command.run", args, None);
        let parsed: Value = serde_json::from_str(&inv.args_json()).unwrap();
        assert_eq!(parsed, json!({"command": "echo hi"}));
    }

    #[test]
    fn test_correlation_ids_are_bounded() {
        for _ in 0..100 {
            assert!(new_correlation_id().len() <= 31);
        }
    }
}
