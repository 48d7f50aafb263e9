//! `facts` plugin executable.

use nodeward_plugin::handlers::{facts, HandlerContext};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let registry = facts::registry(&HandlerContext::from_env());
    std::process::exit(nodeward_plugin::plugin_main(registry).await);
}
