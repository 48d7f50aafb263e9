//! `command` plugin executable.

use nodeward_plugin::handlers::{command, HandlerContext};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let registry = command::registry(&HandlerContext::from_env());
    std::process::exit(nodeward_plugin::plugin_main(registry).await);
}
