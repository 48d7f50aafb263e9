//! Agent wiring: one session, one command observer, one dispatcher.

use anyhow::Result;
use log::{debug, info, warn};
use nodeward_plugin::{HandlerContext, builtin_registry};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::config::{AgentConfig, DispatchMode};
use crate::dispatch::{
    CommandObserver, Dispatcher, InProcessDispatcher, PluginProcessDispatcher, command_pattern,
};
use crate::session::{SessionConfig, SessionEvent, SessionHandle, SessionManager, SessionState};

/// Dispatcher selected by `plugins.dispatch`.
pub fn build_dispatcher(config: &AgentConfig) -> Arc<dyn Dispatcher> {
    let options = config.plugins.run_options();
    let dispatcher: Arc<dyn Dispatcher> = match config.plugins.dispatch {
        DispatchMode::Process => {
            if !Path::new(&config.plugins.dir).is_dir() {
                warn!(
                    "Plugin directory {} does not exist; commands will fail to launch",
                    config.plugins.dir
                );
            }
            Arc::new(
                PluginProcessDispatcher::new(&config.plugins.dir, &config.plugins.prefix, options)
                    .with_env(config.facts.plugin_env()),
            )
        }
        DispatchMode::InProcess => {
            let ctx = HandlerContext::new(options, config.facts.paths());
            Arc::new(InProcessDispatcher::new(builtin_registry(&ctx)))
        }
    };
    dispatcher
}

pub struct Agent {
    manager: SessionManager,
}

impl Agent {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let session = config.xmpp.session_config()?;
        info!(
            "Agent for {} via {}:{} ({:?} dispatch)",
            session.bare_jid(),
            session.host,
            session.port,
            config.plugins.dispatch
        );
        Ok(Self::with_dispatcher(session, build_dispatcher(config)))
    }

    pub fn with_dispatcher(session: SessionConfig, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let mut manager = SessionManager::new(session);
        manager.observe(command_pattern(), Arc::new(CommandObserver::new(dispatcher)));
        Self { manager }
    }

    pub fn handle(&self) -> SessionHandle {
        self.manager.handle()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.manager.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.manager.state()
    }

    /// Serve until `shutdown` flips to `true`.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let events = self.manager.subscribe();
        let logger = tokio::spawn(log_events(events));
        self.manager.run(shutdown).await;
        // The manager is gone, so the event channel is closed.
        let _ = logger.await;
    }
}

async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::AuthFailed(reason)) => warn!("Authentication failed: {}", reason),
            Ok(SessionEvent::StreamEnded) => warn!("Lost connection to server"),
            Ok(event) => debug!("Session event: {:?}", event),
            Err(broadcast::error::RecvError::Lagged(n)) => debug!("Missed {} session events", n),
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_requires_jid() {
        assert!(Agent::new(&AgentConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_in_process_dispatcher_runs_builtins() {
        let mut config = AgentConfig::default();
        config.plugins.dispatch = DispatchMode::InProcess;
        let dispatcher = build_dispatcher(&config);

        let mut args = serde_json::Map::new();
        args.insert("command".into(), serde_json::json!("echo wired"));
        let result = dispatcher
            .dispatch(&nodeward_protocol::CommandInvocation::new("command.run", args, None))
            .await;
        assert_eq!(result.code, 0);
        assert!(result.stdout.contains("wired"));
    }

    #[tokio::test]
    async fn test_process_dispatcher_missing_dir() {
        let mut config = AgentConfig::default();
        config.plugins.dir = "/nonexistent/nodeward/plugins".to_string();
        let dispatcher = build_dispatcher(&config);
        let result = dispatcher
            .dispatch(&nodeward_protocol::CommandInvocation::new(
                "command.run",
                serde_json::Map::new(),
                None,
            ))
            .await;
        assert_eq!(result.code, nodeward_protocol::EXIT_LAUNCH_FAILURE);
    }
}
