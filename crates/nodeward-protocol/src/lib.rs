//! Canonical protocol types for nodeward.
//!
//! These types are shared between the agent daemon and the plugin
//! executables it launches:
//!
//! - [`invocation`]: a command request as received from the server
//! - [`result`]: the `(out, stdout, stderr)` triple every execution yields
//! - [`plugin`]: stdio framing constants for plugin processes
//! - [`stanza`]: element and namespace names used on the XMPP stream

pub mod invocation;
pub mod plugin;
pub mod result;
pub mod stanza;

pub use invocation::{CommandInvocation, new_correlation_id};
pub use plugin::{DiscoveryEntry, E_COMMAND_NOT_DEFINED, E_RUNNING_COMMAND, EXIT_OK};
pub use result::{EXIT_CONVERGE_CHANGED, EXIT_LAUNCH_FAILURE, EXIT_TIMEOUT, ExecutionResult};
