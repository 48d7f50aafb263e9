//! Built-in command handlers.
//!
//! Each module exposes a `registry(ctx)` with the handlers of one plugin
//! executable; [`builtin_registry`] combines all of them for in-process use.

pub mod command;
pub mod facts;
pub mod package;
pub mod puppet;
pub mod script;

use nodeward_exec::{ExecutionEngine, ExecutionResult, FactsPaths, RunOptions};
use serde_json::Value;

use crate::{PluginError, PluginRegistry};

/// What handlers need from their host: how to run processes and where the
/// facts snapshots live.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    pub engine: ExecutionEngine,
    pub facts: FactsPaths,
}

impl HandlerContext {
    pub fn new(options: RunOptions, facts: FactsPaths) -> Self {
        Self {
            engine: ExecutionEngine::with_options(options),
            facts,
        }
    }

    /// Context for a plugin executable: default run options, snapshot paths
    /// from `NODEWARD_ENV_FILE` / `NODEWARD_FACTS_FILE`.
    pub fn from_env() -> Self {
        Self::new(RunOptions::default(), FactsPaths::from_env())
    }
}

/// All built-in handlers.
pub fn builtin_registry(ctx: &HandlerContext) -> PluginRegistry {
    PluginRegistry::new()
        .merge(command::registry(ctx))
        .merge(script::registry(ctx))
        .merge(package::registry(ctx))
        .merge(facts::registry(ctx))
        .merge(puppet::registry(ctx))
}

/// The `{"out", "stdout", "stderr"}` value handlers return.
pub(crate) fn result_value(result: &ExecutionResult) -> Result<Value, PluginError> {
    Ok(serde_json::to_value(result)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_names() {
        let registry = builtin_registry(&HandlerContext::default());
        let names: Vec<_> = registry.names().collect();
        assert_eq!(
            names,
            vec![
                "command_run",
                "facts_write",
                "package_install",
                "puppet_apply",
                "puppet_available",
                "puppet_install",
                "script_run",
            ]
        );
    }
}
