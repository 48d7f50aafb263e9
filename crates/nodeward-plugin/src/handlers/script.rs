//! `script_run`: write a base64 script to a scratch directory and run it.

use async_trait::async_trait;
use log::debug;
use nodeward_exec::{ExecutionEngine, ExecutionRequest, chown_tree, decode_env_payload};
use serde_json::Value;

use super::{HandlerContext, result_value};
use crate::{Args, CommandHandler, PluginError, PluginRegistry};

const DEFAULT_EXTENSION: &str = ".cmd";

pub fn registry(ctx: &HandlerContext) -> PluginRegistry {
    PluginRegistry::new().register(
        "script_run",
        ScriptRun {
            engine: ctx.engine.clone(),
        },
    )
}

pub struct ScriptRun {
    engine: ExecutionEngine,
}

#[async_trait]
impl CommandHandler for ScriptRun {
    fn params(&self) -> &'static [&'static str] {
        &["script", "extension", "envars", "runas", "executable"]
    }

    async fn call(&self, args: Args) -> Result<Value, PluginError> {
        if args.string("script")?.is_none() {
            return Err(PluginError::MissingArgument("script"));
        }
        let script = args
            .base64("script")
            .map_err(|_| PluginError::failed("unable to decode script"))?
            .unwrap_or_default();
        let extension = args
            .string("extension")?
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
        let run_as = args.string("runas")?;

        // Removed on drop, whichever way this function returns.
        let scratch = tempfile::Builder::new().prefix("nodeward-script-").tempdir()?;
        let file = scratch.path().join(format!("script{}", extension));
        std::fs::write(&file, &script)?;
        debug!("Wrote {} bytes to {}", script.len(), file.display());

        if let Some(user) = &run_as {
            // The target user must be able to reach the script.
            chown_tree(scratch.path(), user, None, true)?;
        }

        let request = ExecutionRequest::new()
            .run_as(run_as)
            .workdir(scratch.path())
            .env(decode_env_payload(args.string("envars")?.as_deref()));

        let result = match args.string("executable")? {
            Some(executable) => {
                let command_line = format!("{} {}", executable, file.display());
                self.engine.execute_command(command_line, &request).await
            }
            None => self.engine.execute_file(&file, &request).await,
        };
        result_value(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::json;

    fn handler() -> ScriptRun {
        ScriptRun {
            engine: ExecutionEngine::default(),
        }
    }

    fn call_args(value: Value) -> Args {
        Args::from(value.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_runs_script_file_with_env() {
        let script = STANDARD.encode("#!/bin/sh\necho \"$NAME in $(basename \"$(pwd -P)\")\"\n");
        let envars = STANDARD.encode(json!({"NAME": "nodeward"}).to_string());
        let value = handler()
            .call(call_args(json!({"script": script, "envars": envars})))
            .await
            .unwrap();
        assert_eq!(value["out"], json!(0), "{value}");
        let stdout = value["stdout"].as_str().unwrap();
        assert!(stdout.starts_with("nodeward in nodeward-script-"), "{stdout}");
    }

    #[tokio::test]
    async fn test_runs_through_executable() {
        let script = STANDARD.encode("echo from-sh\n");
        let value = handler()
            .call(call_args(json!({"script": script, "executable": "/bin/sh", "extension": ".sh"})))
            .await
            .unwrap();
        assert_eq!(value, json!({"out": 0, "stdout": "from-sh\n", "stderr": ""}));
    }

    #[tokio::test]
    async fn test_missing_and_undecodable_script() {
        assert!(matches!(
            handler().call(Args::default()).await,
            Err(PluginError::MissingArgument("script"))
        ));
        let err = handler()
            .call(call_args(json!({"script": "***"})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unable to decode script");
    }
}
