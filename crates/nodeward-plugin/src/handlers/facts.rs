//! `facts_write`: persist the env and facts snapshots.

use async_trait::async_trait;
use log::info;
use nodeward_exec::{FactsPaths, write_env_file, write_facts_file};
use serde_json::Value;

use super::HandlerContext;
use crate::{Args, CommandHandler, PluginError, PluginRegistry};

pub fn registry(ctx: &HandlerContext) -> PluginRegistry {
    PluginRegistry::new().register(
        "facts_write",
        FactsWrite {
            paths: ctx.facts.clone(),
        },
    )
}

pub struct FactsWrite {
    paths: FactsPaths,
}

#[async_trait]
impl CommandHandler for FactsWrite {
    fn params(&self) -> &'static [&'static str] {
        &["envars", "facts"]
    }

    async fn call(&self, args: Args) -> Result<Value, PluginError> {
        let envars = args.object("envars")?;
        let facts = args.object("facts")?;
        if envars.is_none() && facts.is_none() {
            return Err(PluginError::failed("nothing to write: give envars and/or facts"));
        }

        if let Some(envars) = envars {
            write_env_file(&self.paths.env_file, &envars)?;
            info!("Updated {} ({} variables)", self.paths.env_file.display(), envars.len());
        }
        if let Some(facts) = facts {
            write_facts_file(&self.paths.facts_file, &facts)?;
            info!("Updated {} ({} facts)", self.paths.facts_file.display(), facts.len());
        }
        Ok(Value::Bool(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FactsWrite {
            paths: FactsPaths {
                env_file: dir.path().join("etc/env"),
                facts_file: dir.path().join("etc/node_info"),
            },
        };
        let args = Args::from(
            json!({"envars": {"B": "2", "A": "1"}, "facts": {"b": "2", "a": "1"}})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(handler.call(args).await.unwrap(), Value::Bool(true));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("etc/env")).unwrap(),
            "export A=\"1\"\nexport B=\"2\"\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("etc/node_info")).unwrap(),
            "a:1\nb:2\n"
        );
    }

    #[tokio::test]
    async fn test_requires_something_to_write() {
        let handler = FactsWrite {
            paths: FactsPaths::default(),
        };
        assert!(handler.call(Args::default()).await.is_err());
    }
}
