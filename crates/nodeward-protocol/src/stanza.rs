//! Element and namespace names of the command payload carried in stanzas.
//!
//! ```xml
//! <iq type="set" id="..." from="...">
//!   <agent_message xmlns="urn:nodeward:agent" version="1">
//!     <command name="script.run">
//!       <args script="..." runas="deploy"/>
//!     </command>
//!   </agent_message>
//! </iq>
//! ```
//!
//! Replies are `iq type="result"` stanzas whose `agent_message` carries a
//! `response` element with `name` and `out` attributes and `stdout`/`stderr`
//! children.

pub const AGENT_NS: &str = "urn:nodeward:agent";
pub const PROTOCOL_VERSION: &str = "1";

pub const MESSAGE: &str = "agent_message";
pub const COMMAND: &str = "command";
pub const ARGS: &str = "args";
pub const RESPONSE: &str = "response";
pub const STDOUT: &str = "stdout";
pub const STDERR: &str = "stderr";

pub const ATTR_NAME: &str = "name";
pub const ATTR_OUT: &str = "out";
pub const ATTR_VERSION: &str = "version";
