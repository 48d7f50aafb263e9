//! Puppet handlers: availability check, manifest apply and installation.

use async_trait::async_trait;
use log::info;
use nodeward_exec::{ExecutionEngine, ProcessRunner, ProcessSpec};
use serde_json::Value;
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use super::package::install_one;
use super::{HandlerContext, result_value};
use crate::{Args, CommandHandler, PluginError, PluginRegistry};

const PUPPET: &str = "puppet";
const DEFAULT_MODULE_PATH: &str = "/etc/puppet/modules";

pub fn registry(ctx: &HandlerContext) -> PluginRegistry {
    PluginRegistry::new()
        .register("puppet_available", PuppetAvailable)
        .register(
            "puppet_apply",
            PuppetApply {
                engine: ctx.engine.clone(),
            },
        )
        .register(
            "puppet_install",
            PuppetInstall {
                engine: ctx.engine.clone(),
            },
        )
}

/// Locate an executable on `PATH`.
fn find_executable(name: &str, path: Option<&OsStr>) -> Option<PathBuf> {
    std::env::split_paths(path?)
        .map(|dir| dir.join(name))
        .find(|candidate| {
            std::fs::metadata(candidate)
                .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

fn puppet_available() -> bool {
    find_executable(PUPPET, std::env::var_os("PATH").as_deref()).is_some()
}

pub struct PuppetAvailable;

#[async_trait]
impl CommandHandler for PuppetAvailable {
    fn params(&self) -> &'static [&'static str] {
        &[]
    }

    async fn call(&self, _args: Args) -> Result<Value, PluginError> {
        if puppet_available() {
            Ok(Value::Bool(true))
        } else {
            Err(PluginError::failed("puppet not found"))
        }
    }
}

pub struct PuppetApply {
    engine: ExecutionEngine,
}

impl PuppetApply {
    fn runner(&self) -> ProcessRunner {
        ProcessRunner::new(self.engine.runner().options().clone().with_converge(true))
    }
}

/// argv for `puppet apply` reading the manifest from stdin.
fn apply_args(module_path: &str, debug: bool) -> Vec<String> {
    let mut args = vec![
        "apply".to_string(),
        "--modulepath".to_string(),
        module_path.to_string(),
        "--detailed-exitcodes".to_string(),
    ];
    if debug {
        args.push("--debug".to_string());
    }
    args
}

#[async_trait]
impl CommandHandler for PuppetApply {
    fn params(&self) -> &'static [&'static str] {
        &["recipe_code", "module_path", "debug"]
    }

    async fn call(&self, args: Args) -> Result<Value, PluginError> {
        if args.string("recipe_code")?.is_none() {
            return Err(PluginError::MissingArgument("recipe_code"));
        }
        let catalog = args
            .base64("recipe_code")
            .map_err(|_| PluginError::failed("unable to decode recipe"))?
            .unwrap_or_default();
        let module_path = args
            .string("module_path")?
            .unwrap_or_else(|| DEFAULT_MODULE_PATH.to_string());
        let debug = args.flag("debug")?;

        let spec = ProcessSpec::new(PUPPET)
            .args(apply_args(&module_path, debug))
            .stdin(catalog);
        let result = self.runner().run(&spec).await;

        if !result.is_success() {
            return Err(PluginError::failed(format!(
                "error running puppet apply: {}",
                result.stderr.trim()
            )));
        }
        result_value(&result)
    }
}

pub struct PuppetInstall {
    engine: ExecutionEngine,
}

#[async_trait]
impl CommandHandler for PuppetInstall {
    fn params(&self) -> &'static [&'static str] {
        &[]
    }

    async fn call(&self, _args: Args) -> Result<Value, PluginError> {
        if puppet_available() {
            return Ok(Value::Bool(false));
        }
        info!("puppet not found, installing");
        install_one(&self.engine, PUPPET).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_args() {
        assert_eq!(
            apply_args("/etc/puppet/modules", false),
            vec!["apply", "--modulepath", "/etc/puppet/modules", "--detailed-exitcodes"]
        );
        assert_eq!(apply_args("/m", true).last().unwrap(), "--debug");
    }

    #[test]
    fn test_find_executable() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        let plain = dir.path().join("plain");
        std::fs::write(&plain, "").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path = std::env::join_paths([PathBuf::from("/nonexistent"), dir.path().to_path_buf()])
            .unwrap();
        assert_eq!(find_executable("tool", Some(path.as_os_str())), Some(tool));
        assert_eq!(find_executable("plain", Some(path.as_os_str())), None);
        assert_eq!(find_executable("tool", None), None);
    }

    #[tokio::test]
    async fn test_apply_requires_recipe() {
        let handler = PuppetApply {
            engine: ExecutionEngine::default(),
        };
        assert!(matches!(
            handler.call(Args::default()).await,
            Err(PluginError::MissingArgument("recipe_code"))
        ));
        let args = Args::from(json!({"recipe_code": "@@@"}).as_object().cloned().unwrap());
        assert_eq!(
            handler.call(args).await.unwrap_err().to_string(),
            "unable to decode recipe"
        );
    }
}
