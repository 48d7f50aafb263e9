//! Handler registry and the plugin stdio protocol.

use async_trait::async_trait;
use log::{debug, warn};
use nodeward_protocol::{DiscoveryEntry, E_COMMAND_NOT_DEFINED, E_RUNNING_COMMAND, EXIT_OK};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Args, PluginError};

/// One named command a plugin can run.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Declared parameter names, printed in discovery mode.
    fn params(&self) -> &'static [&'static str];

    async fn call(&self, args: Args) -> Result<Value, PluginError>;
}

/// Handlers keyed by name (`script_run`, `puppet_apply`, ...).
#[derive(Clone, Default)]
pub struct PluginRegistry {
    handlers: BTreeMap<String, Arc<dyn CommandHandler>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, handler: impl CommandHandler + 'static) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Add every handler of `other`, replacing same-named ones.
    pub fn merge(mut self, other: PluginRegistry) -> Self {
        self.handlers.extend(other.handlers);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Discovery listing, sorted by name.
    pub fn discovery(&self) -> Vec<DiscoveryEntry> {
        self.handlers
            .iter()
            .map(|(name, handler)| DiscoveryEntry::new(name.clone(), handler.params()))
            .collect()
    }

    /// Invoke a handler directly with parsed arguments.
    pub async fn invoke(&self, name: &str, args: Map<String, Value>) -> Result<Value, PluginError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| PluginError::NotDefined(name.to_string()))?;
        debug!("Invoking {} with {} argument(s)", name, args.len());
        handler.call(Args::from(args)).await
    }

    /// Run one protocol exchange and return the process exit code.
    ///
    /// `command` is `argv[1]`; `None` or empty selects discovery mode.
    pub async fn run<R, W, E>(&self, command: Option<&str>, mut input: R, out: &mut W, err: &mut E) -> i32
    where
        R: AsyncRead + Unpin,
        W: Write,
        E: Write,
    {
        let Some(name) = command.filter(|c| !c.is_empty()) else {
            for entry in self.discovery() {
                if let Err(e) = writeln!(out, "{}", entry) {
                    warn!("Writing discovery output failed: {}", e);
                }
            }
            return EXIT_OK;
        };

        if !self.contains(name) {
            let _ = writeln!(err, "Command not defined ({})", name);
            return E_COMMAND_NOT_DEFINED;
        }

        let mut raw = String::new();
        let outcome = match input.read_to_string(&mut raw).await {
            Ok(_) => match parse_payload(&raw) {
                Ok(args) => self.invoke(name, args).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(PluginError::Io(e)),
        };

        let written = match outcome {
            Ok(value) => writeln!(out, "{}", value).and_then(|_| out.flush()),
            Err(e) => {
                let _ = writeln!(err, "Error running command {}: {}", name, e);
                return E_RUNNING_COMMAND;
            }
        };
        match written {
            Ok(()) => EXIT_OK,
            Err(e) => {
                let _ = writeln!(err, "Error writing result of {}: {}", name, e);
                E_RUNNING_COMMAND
            }
        }
    }
}

/// Parse stdin into the keyword argument object. Empty input means no arguments.
pub fn parse_payload(raw: &str) -> Result<Map<String, Value>, PluginError> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str(raw) {
        Ok(Value::Object(args)) => Ok(args),
        Ok(other) => Err(PluginError::Payload(format!(
            "expected a JSON object, got {}",
            other
        ))),
        Err(e) => Err(PluginError::Payload(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        fn params(&self) -> &'static [&'static str] {
            &["message"]
        }

        async fn call(&self, args: Args) -> Result<Value, PluginError> {
            Ok(json!({ "echo": args.required_string("message")? }))
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl CommandHandler for Counting {
        fn params(&self) -> &'static [&'static str] {
            &[]
        }

        async fn call(&self, _args: Args) -> Result<Value, PluginError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Bool(true))
        }
    }

    async fn run(registry: &PluginRegistry, command: Option<&str>, stdin: &str) -> (i32, String, String) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = registry.run(command, stdin.as_bytes(), &mut out, &mut err).await;
        (
            code,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_discovery_mode() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = PluginRegistry::new()
            .register("echo_say", Echo)
            .register("count", Counting(calls.clone()));

        for command in [None, Some("")] {
            let (code, out, err) = run(&registry, command, "{}").await;
            assert_eq!(code, EXIT_OK);
            assert_eq!(out, "count  []\necho_say  [message]\n");
            assert!(err.is_empty());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = PluginRegistry::new().register("count", Counting(calls.clone()));
        let (code, out, err) = run(&registry, Some("nope"), "{}").await;
        assert_eq!(code, E_COMMAND_NOT_DEFINED);
        assert!(out.is_empty());
        assert!(err.contains("nope"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_writes_json() {
        let registry = PluginRegistry::new().register("echo_say", Echo);
        let (code, out, err) = run(&registry, Some("echo_say"), "{\"message\": \"hi\"}\n").await;
        assert_eq!(code, EXIT_OK, "{err}");
        assert_eq!(serde_json::from_str::<Value>(&out).unwrap(), json!({"echo": "hi"}));
    }

    #[tokio::test]
    async fn test_handler_error_is_running_command_error() {
        let registry = PluginRegistry::new().register("echo_say", Echo);
        let (code, out, err) = run(&registry, Some("echo_say"), "{}").await;
        assert_eq!(code, E_RUNNING_COMMAND);
        assert!(out.is_empty());
        assert!(err.contains("missing required argument 'message'"));
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = PluginRegistry::new().register("count", Counting(calls.clone()));
        for payload in ["{not json", "[1, 2]", "\"text\""] {
            let (code, _, err) = run(&registry, Some("count"), payload).await;
            assert_eq!(code, E_RUNNING_COMMAND, "{payload}");
            assert!(err.contains("invalid argument payload"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_stdin_means_no_arguments() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = PluginRegistry::new().register("count", Counting(calls.clone()));
        let (code, out, _) = run(&registry, Some("count"), "").await;
        assert_eq!(code, EXIT_OK);
        assert_eq!(out, "true\n");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invoke_not_defined() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.invoke("missing", Map::new()).await,
            Err(PluginError::NotDefined(name)) if name == "missing"
        ));
    }
}
