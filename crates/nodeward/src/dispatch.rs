//! Command stanzas: parsing, dispatch to plugins, replies.

use async_trait::async_trait;
use log::{debug, info, warn};
use nodeward_exec::{ProcessRunner, ProcessSpec, RunOptions};
use nodeward_plugin::{PluginError, PluginRegistry};
use nodeward_protocol::{
    CommandInvocation, E_COMMAND_NOT_DEFINED, E_RUNNING_COMMAND, ExecutionResult, stanza,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::session::{SessionHandle, StanzaHandler, StanzaPattern};
use crate::xml::Element;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("missing <{0}> element")]
    MissingElement(&'static str),

    #[error("command has no name")]
    MissingName,
}

/// Runs a [`CommandInvocation`] somewhere and reports the outcome.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, invocation: &CommandInvocation) -> ExecutionResult;
}

/// Launches `<dir>/<prefix><plugin>` per invocation and speaks the plugin
/// stdio protocol with it.
#[derive(Debug, Clone)]
pub struct PluginProcessDispatcher {
    dir: PathBuf,
    prefix: String,
    runner: ProcessRunner,
    env: HashMap<String, String>,
}

impl PluginProcessDispatcher {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, options: RunOptions) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            runner: ProcessRunner::new(options.with_echo(false)),
            env: HashMap::new(),
        }
    }

    /// Extra environment passed to every plugin process.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn executable_for(&self, invocation: &CommandInvocation) -> PathBuf {
        self.dir
            .join(format!("{}{}", self.prefix, invocation.plugin_name()))
    }
}

#[async_trait]
impl Dispatcher for PluginProcessDispatcher {
    async fn dispatch(&self, invocation: &CommandInvocation) -> ExecutionResult {
        let executable = self.executable_for(invocation);
        debug!(
            "Running {} {} for {}",
            executable.display(),
            invocation.handler_name(),
            invocation.id
        );
        let spec = ProcessSpec::new(executable.to_string_lossy())
            .arg(invocation.handler_name())
            .stdin(invocation.args_json())
            .env(self.env.clone());
        self.runner.run(&spec).await
    }
}

/// Calls the built-in handlers directly, mapping outcomes onto the plugin
/// protocol's exit codes.
#[derive(Debug, Clone)]
pub struct InProcessDispatcher {
    registry: PluginRegistry,
}

impl InProcessDispatcher {
    pub fn new(registry: PluginRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Dispatcher for InProcessDispatcher {
    async fn dispatch(&self, invocation: &CommandInvocation) -> ExecutionResult {
        let handler = invocation.handler_name();
        match self.registry.invoke(&handler, invocation.args.clone()).await {
            Ok(value) => ExecutionResult::new(0, format!("{}\n", value), ""),
            Err(PluginError::NotDefined(name)) => ExecutionResult::new(
                E_COMMAND_NOT_DEFINED,
                "",
                format!("Command not defined ({})\n", name),
            ),
            Err(e) => ExecutionResult::new(
                E_RUNNING_COMMAND,
                "",
                format!("Error running command {}: {}\n", handler, e),
            ),
        }
    }
}

/// Pattern selecting command requests.
pub fn command_pattern() -> StanzaPattern {
    StanzaPattern::new("iq")
        .with_attr("type", "set")
        .with_child(stanza::MESSAGE, Some(stanza::AGENT_NS))
}

/// Extract the invocation carried by a command `iq`.
///
/// Arguments arrive as attribute strings on `<args/>`.
pub fn parse_invocation(iq: &Element) -> Result<CommandInvocation, DispatchError> {
    let message = iq
        .find_ns(stanza::MESSAGE, stanza::AGENT_NS)
        .ok_or(DispatchError::MissingElement(stanza::MESSAGE))?;
    let command = message
        .find(stanza::COMMAND)
        .ok_or(DispatchError::MissingElement(stanza::COMMAND))?;
    let name = command
        .get_attr(stanza::ATTR_NAME)
        .filter(|name| !name.is_empty())
        .ok_or(DispatchError::MissingName)?;

    let args: Map<String, Value> = command
        .find(stanza::ARGS)
        .map(|args| {
            args.attrs
                .iter()
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect()
        })
        .unwrap_or_default();

    let invocation = CommandInvocation::new(name, args, iq.get_attr("id").map(String::from));
    Ok(match iq.get_attr("from") {
        Some(from) => invocation.with_reply_to(from),
        None => invocation,
    })
}

/// `iq type="result"` reply carrying the execution result.
pub fn response_stanza(invocation: &CommandInvocation, result: &ExecutionResult) -> Element {
    let response = Element::new(stanza::RESPONSE)
        .attr(stanza::ATTR_NAME, invocation.name.as_str())
        .attr(stanza::ATTR_OUT, result.code.to_string())
        .child(Element::new(stanza::STDOUT).text(result.stdout.as_str()))
        .child(Element::new(stanza::STDERR).text(result.stderr.as_str()));

    let mut iq = Element::new("iq")
        .attr("type", "result")
        .attr("id", invocation.id.as_str());
    if let Some(to) = &invocation.reply_to {
        iq.set_attr("to", to.as_str());
    }
    iq.child(
        Element::new(stanza::MESSAGE)
            .attr("xmlns", stanza::AGENT_NS)
            .attr(stanza::ATTR_VERSION, stanza::PROTOCOL_VERSION)
            .child(response),
    )
}

/// `iq type="error"` reply for a request that could not be parsed.
fn bad_request(iq: &Element, reason: &DispatchError) -> Element {
    let mut reply = Element::new("iq").attr("type", "error");
    if let Some(from) = iq.get_attr("from") {
        reply.set_attr("to", from);
    }
    if let Some(id) = iq.get_attr("id") {
        reply.set_attr("id", id);
    }
    reply.child(
        Element::new("error")
            .attr("type", "modify")
            .child(Element::new("bad-request").attr("xmlns", crate::session::STANZA_ERROR_NS))
            .child(
                Element::new("text")
                    .attr("xmlns", crate::session::STANZA_ERROR_NS)
                    .text(reason.to_string()),
            ),
    )
}

/// Stanza observer that hands each command to a [`Dispatcher`] on its own task
/// and sends the reply when it finishes.
pub struct CommandObserver {
    dispatcher: Arc<dyn Dispatcher>,
}

impl CommandObserver {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl StanzaHandler for CommandObserver {
    fn handle(&self, iq: &Element, session: &SessionHandle) {
        let invocation = match parse_invocation(iq) {
            Ok(invocation) => invocation,
            Err(e) => {
                warn!("Rejecting malformed command stanza: {}", e);
                if let Err(e) = session.send(bad_request(iq, &e)) {
                    warn!("Failed to send error reply: {}", e);
                }
                return;
            }
        };

        info!("Received {} ({})", invocation.name, invocation.id);
        let dispatcher = self.dispatcher.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let result = dispatcher.dispatch(&invocation).await;
            info!(
                "{} ({}) finished with code {}",
                invocation.name, invocation.id, result.code
            );
            if let Err(e) = session.send(response_stanza(&invocation, &result)) {
                warn!("Dropping result of {}: {}", invocation.id, e);
            }
        });
    }
}
