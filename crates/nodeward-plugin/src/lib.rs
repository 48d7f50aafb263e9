//! Plugin side of nodeward.
//!
//! A plugin executable serves one command per launch over stdio (see
//! [`nodeward_protocol::plugin`]). [`PluginRegistry`] implements that
//! protocol for a set of [`CommandHandler`]s; the same registry can be
//! invoked in-process by the agent.

pub mod args;
pub mod error;
pub mod handlers;
pub mod registry;

pub use args::Args;
pub use error::PluginError;
pub use handlers::{HandlerContext, builtin_registry};
pub use registry::{CommandHandler, PluginRegistry, parse_payload};

/// Entry point shared by the plugin binaries.
///
/// Serves `argv[1]` from `registry` over the process's stdio and returns the
/// exit code.
pub async fn plugin_main(registry: PluginRegistry) -> i32 {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let command = std::env::args().nth(1);
    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr().lock();
    registry
        .run(command.as_deref(), tokio::io::stdin(), &mut stdout, &mut stderr)
        .await
}
