//! nodeward agent: keeps an XMPP session to the control server and runs the
//! commands it receives through plugins.

pub mod agent;
pub mod config;
pub mod dispatch;
pub mod session;
pub mod stream;
pub mod xml;

pub use agent::{Agent, build_dispatcher};
pub use config::{AgentConfig, DispatchMode, load_config};
pub use dispatch::{CommandObserver, Dispatcher, InProcessDispatcher, PluginProcessDispatcher};
pub use session::{
    SessionConfig, SessionError, SessionEvent, SessionHandle, SessionManager, SessionState,
    StanzaHandler, StanzaPattern,
};
pub use xml::Element;
