//! `package_install`: install distribution packages.

use async_trait::async_trait;
use nodeward_exec::packages::install_with;
use nodeward_exec::{Distribution, ExecutionEngine, install_packages};
use serde_json::Value;

use super::{HandlerContext, result_value};
use crate::{Args, CommandHandler, PluginError, PluginRegistry};

pub fn registry(ctx: &HandlerContext) -> PluginRegistry {
    PluginRegistry::new().register(
        "package_install",
        PackageInstall {
            engine: ctx.engine.clone(),
        },
    )
}

pub struct PackageInstall {
    engine: ExecutionEngine,
}

#[async_trait]
impl CommandHandler for PackageInstall {
    fn params(&self) -> &'static [&'static str] {
        &["packages", "update", "distribution"]
    }

    async fn call(&self, args: Args) -> Result<Value, PluginError> {
        let packages = args.list("packages")?;
        if packages.is_empty() {
            return Err(PluginError::MissingArgument("packages"));
        }
        let update = refresh_requested(&args)?;

        let result = match args.string("distribution")? {
            Some(id) => install_packages(&self.engine, &id, &packages, update).await?,
            None => install_with(&self.engine, Distribution::detect()?, &packages, update).await?,
        };
        result_value(&result)
    }
}

/// The package cache is refreshed unless the caller passes `update` false.
fn refresh_requested(args: &Args) -> Result<bool, PluginError> {
    args.flag_or("update", true)
}

/// Install one package on the detected distribution, refreshing the cache first.
pub(crate) async fn install_one(engine: &ExecutionEngine, package: &str) -> Result<Value, PluginError> {
    let distro = Distribution::detect()?;
    let result = install_with(engine, distro, &[package.to_string()], true).await?;
    result_value(&result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeward_exec::PackageError;
    use serde_json::json;

    fn handler() -> PackageInstall {
        PackageInstall {
            engine: ExecutionEngine::default(),
        }
    }

    #[tokio::test]
    async fn test_unsupported_distribution_raises() {
        let args = Args::from(
            json!({"packages": "vim", "distribution": "solaris"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let err = handler().call(args).await.unwrap_err();
        assert!(matches!(
            err,
            PluginError::Package(PackageError::UnsupportedDistribution(_))
        ));
    }

    #[tokio::test]
    async fn test_packages_required() {
        assert!(matches!(
            handler().call(Args::default()).await,
            Err(PluginError::MissingArgument("packages"))
        ));
    }

    #[test]
    fn test_cache_refresh_defaults_on() {
        let object = |value: Value| Args::from(value.as_object().cloned().unwrap());
        assert!(refresh_requested(&object(json!({"packages": "vim"}))).unwrap());
        assert!(!refresh_requested(&object(json!({"packages": "vim", "update": "0"}))).unwrap());
        assert!(!refresh_requested(&object(json!({"packages": "vim", "update": false}))).unwrap());
        assert!(refresh_requested(&object(json!({"packages": "vim", "update": "1"}))).unwrap());
    }
}
