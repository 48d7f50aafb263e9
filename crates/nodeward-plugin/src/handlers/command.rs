//! `command_run`: run a command line through the execution engine.

use async_trait::async_trait;
use nodeward_exec::{ExecutionEngine, ExecutionRequest, decode_env_payload};
use serde_json::Value;

use super::{HandlerContext, result_value};
use crate::{Args, CommandHandler, PluginError, PluginRegistry};

pub fn registry(ctx: &HandlerContext) -> PluginRegistry {
    PluginRegistry::new().register(
        "command_run",
        CommandRun {
            engine: ctx.engine.clone(),
        },
    )
}

pub struct CommandRun {
    engine: ExecutionEngine,
}

#[async_trait]
impl CommandHandler for CommandRun {
    fn params(&self) -> &'static [&'static str] {
        &["command", "stdin", "runas", "workdir", "envars"]
    }

    async fn call(&self, args: Args) -> Result<Value, PluginError> {
        let command = args.required_string("command")?;
        let mut request = ExecutionRequest::new()
            .run_as(args.string("runas")?)
            .env(decode_env_payload(args.string("envars")?.as_deref()));
        if let Some(stdin) = args.string("stdin")? {
            request = request.stdin(stdin);
        }
        if let Some(workdir) = args.string("workdir")? {
            request = request.workdir(workdir);
        }

        let result = self.engine.execute_command(command, &request).await;
        result_value(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call_args(value: Value) -> Args {
        Args::from(value.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_command_run() {
        let handler = CommandRun {
            engine: ExecutionEngine::default(),
        };
        let value = handler
            .call(call_args(json!({"command": "echo hello"})))
            .await
            .unwrap();
        assert_eq!(value, json!({"out": 0, "stdout": "hello\n", "stderr": ""}));
    }

    #[tokio::test]
    async fn test_command_run_stdin_and_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let handler = CommandRun {
            engine: ExecutionEngine::default(),
        };
        let value = handler
            .call(call_args(json!({
                "command": "sh -c 'cat; pwd -P'",
                "stdin": "in\n",
                "workdir": dir.path().to_string_lossy(),
            })))
            .await
            .unwrap();
        let expected = format!("in\n{}\n", dir.path().canonicalize().unwrap().display());
        assert_eq!(value["stdout"], json!(expected));
    }

    #[tokio::test]
    async fn test_command_required() {
        let handler = CommandRun {
            engine: ExecutionEngine::default(),
        };
        assert!(matches!(
            handler.call(Args::default()).await,
            Err(PluginError::MissingArgument("command"))
        ));
    }
}
