//! `puppet` plugin executable.

use nodeward_plugin::handlers::{puppet, HandlerContext};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let registry = puppet::registry(&HandlerContext::from_env());
    std::process::exit(nodeward_plugin::plugin_main(registry).await);
}
