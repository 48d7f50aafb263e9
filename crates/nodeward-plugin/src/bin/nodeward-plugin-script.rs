//! `script` plugin executable.

use nodeward_plugin::handlers::{script, HandlerContext};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let registry = script::registry(&HandlerContext::from_env());
    std::process::exit(nodeward_plugin::plugin_main(registry).await);
}
