//! XMPP client session state machine.
//!
//! One [`SessionManager`] owns the connection to the server for the lifetime
//! of the agent. Every attempt walks the same states:
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingAuth -> Authenticated -> StreamEnded
//!                                    |
//!                                    +-> Registering (auth rejected)
//! ```
//!
//! Authentication is the non-SASL `jabber:iq:auth` exchange. On rejection the
//! manager registers the account in-band (`jabber:iq:register`) and then waits
//! a fixed delay before dropping the stream and reconnecting. A registration
//! result never restarts authentication on the same stream.
//!
//! All stream I/O and stanza dispatch happen on the task running
//! [`SessionManager::run`]. Observers are called inline and must hand long
//! work off to other tasks.

use log::{debug, info, trace, warn};
use nodeward_protocol::new_correlation_id;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::stream::{STREAM_CLOSE, StreamEvent, read_stream, stream_header};
use crate::xml::{Element, XmlError};

pub const AUTH_NS: &str = "jabber:iq:auth";
pub const REGISTER_NS: &str = "jabber:iq:register";
pub const PING_NS: &str = "urn:xmpp:ping";
pub const STANZA_ERROR_NS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Payload of a keepalive tick.
const KEEPALIVE: &str = "\n";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connecting to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connecting to {0} timed out")]
    ConnectTimeout(String),

    #[error("stream I/O: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error("stream closed during {0}")]
    ClosedDuring(&'static str),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("invalid JID '{0}'")]
    InvalidJid(String),

    #[error("session closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingAuth,
    Registering,
    Authenticated,
    StreamEnded,
}

/// Lifecycle notifications for the owning process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Authenticated,
    AuthFailed(String),
    Registering,
    StreamEnded,
    Reconnecting { delay: Duration },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub username: String,
    pub domain: String,
    pub password: String,
    pub resource: String,
    pub host: String,
    pub port: u16,
    pub keepalive: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub register_retry_delay: Duration,
    pub auto_register: bool,
    pub connect_timeout: Duration,
}

impl SessionConfig {
    /// Defaults for `jid` (`user@domain`, optional `/resource`), connecting
    /// to the JID's domain on port 5222.
    pub fn new(jid: &str, password: impl Into<String>) -> Result<Self, SessionError> {
        let (bare, resource) = match jid.split_once('/') {
            Some((bare, resource)) if !resource.is_empty() => (bare, resource),
            _ => (jid.trim_end_matches('/'), "nodeward"),
        };
        let (username, domain) = bare
            .split_once('@')
            .filter(|(user, domain)| !user.is_empty() && !domain.is_empty())
            .ok_or_else(|| SessionError::InvalidJid(jid.to_string()))?;

        Ok(Self {
            username: username.to_string(),
            domain: domain.to_string(),
            password: password.into(),
            resource: resource.to_string(),
            host: domain.to_string(),
            port: 5222,
            keepalive: Duration::from_secs(60),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            register_retry_delay: Duration::from_secs(3),
            auto_register: true,
            connect_timeout: Duration::from_secs(30),
        })
    }

    pub fn bare_jid(&self) -> String {
        format!("{}@{}", self.username, self.domain)
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Selects stanzas by element name, attribute values and an optional child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StanzaPattern {
    name: String,
    attrs: Vec<(String, String)>,
    child: Option<(String, Option<String>)>,
}

impl StanzaPattern {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), value.into()));
        self
    }

    /// Require a direct child called `name`, in namespace `ns` if given.
    pub fn with_child(mut self, name: impl Into<String>, ns: Option<&str>) -> Self {
        self.child = Some((name.into(), ns.map(String::from)));
        self
    }

    pub fn matches(&self, stanza: &Element) -> bool {
        if stanza.name != self.name {
            return false;
        }
        if !self
            .attrs
            .iter()
            .all(|(name, value)| stanza.get_attr(name) == Some(value.as_str()))
        {
            return false;
        }
        match &self.child {
            None => true,
            Some((name, None)) => stanza.find(name).is_some(),
            Some((name, Some(ns))) => stanza.find_ns(name, ns).is_some(),
        }
    }
}

/// Callback for stanzas matching a [`StanzaPattern`].
///
/// Runs on the session task: it must not block.
pub trait StanzaHandler: Send + Sync {
    fn handle(&self, stanza: &Element, session: &SessionHandle);
}

/// Cloneable sender for outbound stanzas.
///
/// Stanzas queued while the session is not authenticated are sent once it is.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Element>,
}

impl SessionHandle {
    /// Queue `stanza`, assigning an `id` if it has none. Returns the id.
    pub fn send(&self, mut stanza: Element) -> Result<String, SessionError> {
        let id = match stanza.get_attr("id") {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = new_correlation_id();
                stanza.set_attr("id", id.clone());
                id
            }
        };
        self.tx.send(stanza).map_err(|_| SessionError::Closed)?;
        Ok(id)
    }
}

/// Exponential reconnect delay: doubles per failure up to a ceiling.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

/// How one connection attempt ended.
#[derive(Debug)]
enum Attempt {
    Shutdown,
    /// Registration finished its fixed wait; reconnect right away.
    Reregister,
    Ended,
    Failed(SessionError),
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct SessionManager {
    config: SessionConfig,
    observers: Vec<(StanzaPattern, Arc<dyn StanzaHandler>)>,
    handle: SessionHandle,
    outbound: mpsc::UnboundedReceiver<Element>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<SessionState>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        let (tx, outbound) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            observers: Vec::new(),
            handle: SessionHandle { tx },
            outbound,
            events,
            state,
        }
    }

    /// Register `handler` for stanzas matching `pattern` once authenticated.
    pub fn observe(&mut self, pattern: StanzaPattern, handler: Arc<dyn StanzaHandler>) {
        self.observers.push((pattern, handler));
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Connect, authenticate and serve until `shutdown` becomes `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(
            self.config.initial_reconnect_delay,
            self.config.max_reconnect_delay,
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = self.attempt(&mut shutdown, &mut backoff).await;
            let delay = match outcome {
                Attempt::Shutdown => break,
                Attempt::Reregister => Duration::ZERO,
                Attempt::Ended => backoff.next_delay(),
                Attempt::Failed(e) => {
                    warn!("Session with {} failed: {}", self.config.addr(), e);
                    backoff.next_delay()
                }
            };
            self.set_state(SessionState::Disconnected);

            info!("Reconnecting to {} in {:?}", self.config.addr(), delay);
            self.emit(SessionEvent::Reconnecting { delay });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        self.set_state(SessionState::Disconnected);
        info!("Session closed");
    }

    async fn attempt(&mut self, shutdown: &mut watch::Receiver<bool>, backoff: &mut Backoff) -> Attempt {
        self.set_state(SessionState::Connecting);
        let addr = self.config.addr();
        let connect = TcpStream::connect((self.config.host.as_str(), self.config.port));
        let stream = tokio::select! {
            connected = tokio::time::timeout(self.config.connect_timeout, connect) => match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => return Attempt::Failed(SessionError::Connect { addr, source }),
                Err(_) => return Attempt::Failed(SessionError::ConnectTimeout(addr)),
            },
            _ = shutdown_requested(shutdown) => return Attempt::Shutdown,
        };

        let (read_half, mut writer) = stream.into_split();
        let (tx, mut inbound) = mpsc::channel(64);
        let _reader = AbortOnDrop(tokio::spawn(read_stream(BufReader::new(read_half), tx)));

        info!("Connected to {}", addr);
        self.emit(SessionEvent::Connected);
        self.set_state(SessionState::AwaitingAuth);

        if let Err(e) = write_raw(&mut writer, &stream_header(&self.config.domain)).await {
            return Attempt::Failed(e.into());
        }

        let mut auth_id: Option<String> = None;
        let mut register_id: Option<String> = None;
        let mut phase = SessionState::AwaitingAuth;

        let mut keepalive = tokio::time::interval_at(
            Instant::now() + self.config.keepalive,
            self.config.keepalive,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let retry = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(retry);
        let mut retry_armed = false;

        loop {
            tokio::select! {
                _ = shutdown_requested(shutdown) => {
                    debug!("Closing stream for shutdown");
                    let _ = write_raw(&mut writer, STREAM_CLOSE).await;
                    let _ = writer.shutdown().await;
                    return Attempt::Shutdown;
                }

                event = inbound.recv() => {
                    let stanza = match event {
                        Some(StreamEvent::Header { id, .. }) => {
                            debug!("Server opened stream {:?}", id);
                            if phase == SessionState::AwaitingAuth && auth_id.is_none() {
                                let request = self.auth_request();
                                auth_id = request.get_attr("id").map(String::from);
                                if let Err(e) = send_stanza(&mut writer, &request, true).await {
                                    return Attempt::Failed(e.into());
                                }
                            }
                            continue;
                        }
                        Some(StreamEvent::Stanza(stanza)) => stanza,
                        Some(StreamEvent::Error(e)) => return self.stream_ended(phase, Some(e.into())),
                        Some(StreamEvent::End) | None => return self.stream_ended(phase, None),
                    };
                    debug!("RECV: {}", stanza);

                    match phase {
                        SessionState::AwaitingAuth if is_reply_to(&stanza, auth_id.as_deref()) => {
                            if stanza.get_attr("type") == Some("result") {
                                if let Err(e) = self.authenticated(&mut writer, backoff).await {
                                    return Attempt::Failed(e.into());
                                }
                                phase = SessionState::Authenticated;
                                keepalive.reset();
                                continue;
                            }

                            let reason = error_condition(&stanza);
                            warn!("Authentication as {} rejected: {}", self.config.bare_jid(), reason);
                            self.emit(SessionEvent::AuthFailed(reason.clone()));
                            if !self.config.auto_register {
                                return Attempt::Failed(SessionError::AuthRejected(reason));
                            }

                            let request = self.register_request();
                            register_id = request.get_attr("id").map(String::from);
                            if let Err(e) = send_stanza(&mut writer, &request, true).await {
                                return Attempt::Failed(e.into());
                            }
                            info!("Registering account {}", self.config.bare_jid());
                            phase = SessionState::Registering;
                            self.set_state(phase);
                            self.emit(SessionEvent::Registering);
                            retry.as_mut().reset(Instant::now() + self.config.register_retry_delay);
                            retry_armed = true;
                        }
                        SessionState::Registering if is_reply_to(&stanza, register_id.as_deref()) => {
                            // Whatever the outcome, the next auth attempt happens on a new stream.
                            match stanza.get_attr("type") {
                                Some("result") => info!("Registered {}", self.config.bare_jid()),
                                _ => warn!(
                                    "Registration of {} failed: {}",
                                    self.config.bare_jid(),
                                    error_condition(&stanza)
                                ),
                            }
                        }
                        SessionState::Authenticated => {
                            if let Err(e) = self.dispatch(&stanza, &mut writer).await {
                                return Attempt::Failed(e.into());
                            }
                        }
                        _ => debug!("Ignoring <{}> during {:?}", stanza.name, phase),
                    }
                }

                Some(stanza) = self.outbound.recv(), if phase == SessionState::Authenticated => {
                    if let Err(e) = send_stanza(&mut writer, &stanza, false).await {
                        return Attempt::Failed(e.into());
                    }
                    keepalive.reset();
                }

                _ = keepalive.tick(), if phase == SessionState::Authenticated => {
                    trace!("Sending keepalive");
                    if let Err(e) = write_raw(&mut writer, KEEPALIVE).await {
                        return Attempt::Failed(e.into());
                    }
                }

                _ = &mut retry, if retry_armed => {
                    debug!("Dropping stream to retry authentication after registration");
                    let _ = write_raw(&mut writer, STREAM_CLOSE).await;
                    let _ = writer.shutdown().await;
                    return Attempt::Reregister;
                }
            }
        }
    }

    async fn authenticated(&self, writer: &mut OwnedWriteHalf, backoff: &mut Backoff) -> io::Result<()> {
        info!("Authenticated as {}/{}", self.config.bare_jid(), self.config.resource);
        backoff.reset();
        self.set_state(SessionState::Authenticated);
        self.emit(SessionEvent::Authenticated);
        send_stanza(writer, &Element::new("presence"), false).await
    }

    fn stream_ended(&self, phase: SessionState, error: Option<SessionError>) -> Attempt {
        if phase == SessionState::Authenticated {
            match &error {
                Some(e) => warn!("Stream ended with error: {}", e),
                None => info!("Stream ended"),
            }
            self.set_state(SessionState::StreamEnded);
            self.emit(SessionEvent::StreamEnded);
            return Attempt::Ended;
        }
        Attempt::Failed(error.unwrap_or(SessionError::ClosedDuring(match phase {
            SessionState::Registering => "registration",
            _ => "authentication",
        })))
    }

    /// Route an inbound stanza to matching observers.
    async fn dispatch(&self, stanza: &Element, writer: &mut OwnedWriteHalf) -> io::Result<()> {
        let mut matched = false;
        for (pattern, handler) in &self.observers {
            if pattern.matches(stanza) {
                matched = true;
                handler.handle(stanza, &self.handle);
            }
        }
        if matched || stanza.name != "iq" {
            return Ok(());
        }

        match stanza.get_attr("type") {
            Some("get") if stanza.find_ns("ping", PING_NS).is_some() => {
                send_stanza(writer, &iq_reply(stanza, "result"), false).await
            }
            Some("get") | Some("set") => {
                debug!("No handler for iq {:?}", stanza.get_attr("id"));
                let error = iq_reply(stanza, "error").child(
                    Element::new("error").attr("type", "cancel").child(
                        Element::new("service-unavailable").attr("xmlns", STANZA_ERROR_NS),
                    ),
                );
                send_stanza(writer, &error, false).await
            }
            _ => Ok(()),
        }
    }

    fn auth_request(&self) -> Element {
        Element::new("iq")
            .attr("type", "set")
            .attr("id", new_correlation_id())
            .child(
                Element::new("query")
                    .attr("xmlns", AUTH_NS)
                    .child(Element::new("username").text(self.config.username.as_str()))
                    .child(Element::new("password").text(self.config.password.as_str()))
                    .child(Element::new("resource").text(self.config.resource.as_str())),
            )
    }

    fn register_request(&self) -> Element {
        Element::new("iq")
            .attr("type", "set")
            .attr("id", new_correlation_id())
            .child(
                Element::new("query")
                    .attr("xmlns", REGISTER_NS)
                    .child(Element::new("username").text(self.config.username.as_str()))
                    .child(Element::new("password").text(self.config.password.as_str())),
            )
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: SessionState) {
        debug!("Session state -> {:?}", state);
        self.state.send_replace(state);
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender gone: nobody can ask for shutdown anymore.
            std::future::pending::<()>().await;
        }
    }
}

fn is_reply_to(stanza: &Element, id: Option<&str>) -> bool {
    stanza.name == "iq" && id.is_some() && stanza.get_attr("id") == id
}

/// Reply skeleton addressed back to the sender of `request`.
fn iq_reply(request: &Element, kind: &str) -> Element {
    let mut reply = Element::new("iq").attr("type", kind);
    if let Some(from) = request.get_attr("from") {
        reply.set_attr("to", from);
    }
    if let Some(id) = request.get_attr("id") {
        reply.set_attr("id", id);
    }
    reply
}

/// Name of the defined condition inside an `<error/>`, or its code.
fn error_condition(stanza: &Element) -> String {
    let Some(error) = stanza.find("error") else {
        return "unknown error".to_string();
    };
    error
        .elements()
        .next()
        .map(|condition| condition.name.clone())
        .or_else(|| error.get_attr("code").map(|code| format!("code {}", code)))
        .unwrap_or_else(|| "unknown error".to_string())
}

async fn write_raw(writer: &mut OwnedWriteHalf, data: &str) -> io::Result<()> {
    writer.write_all(data.as_bytes()).await?;
    writer.flush().await
}

async fn send_stanza(writer: &mut OwnedWriteHalf, stanza: &Element, sensitive: bool) -> io::Result<()> {
    let xml = stanza.to_xml();
    if sensitive {
        debug!("SEND: <{} id={:?}> (contents hidden)", stanza.name, stanza.get_attr("id"));
    } else {
        debug!("SEND: {}", xml);
    }
    write_raw(writer, &xml).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_jid() {
        let config = SessionConfig::new("node1@fleet.example.com", "secret").unwrap();
        assert_eq!(config.username, "node1");
        assert_eq!(config.domain, "fleet.example.com");
        assert_eq!(config.host, "fleet.example.com");
        assert_eq!(config.resource, "nodeward");
        assert_eq!(config.port, 5222);
        assert_eq!(config.keepalive, Duration::from_secs(60));

        let with_resource = SessionConfig::new("node1@example.com/agent", "x").unwrap();
        assert_eq!(with_resource.resource, "agent");
        assert_eq!(with_resource.bare_jid(), "node1@example.com");
    }

    #[test]
    fn test_invalid_jids() {
        for jid in ["", "nodomain", "@example.com", "user@"] {
            assert!(
                matches!(SessionConfig::new(jid, "x"), Err(SessionError::InvalidJid(_))),
                "{jid}"
            );
        }
    }

    #[test]
    fn test_backoff_doubles_to_ceiling_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_pattern_matching() {
        let pattern = StanzaPattern::new("iq")
            .with_attr("type", "set")
            .with_child("agent_message", Some("urn:nodeward:agent"));

        let stanza = Element::new("iq").attr("type", "set").child(
            Element::new("agent_message").attr("xmlns", "urn:nodeward:agent"),
        );
        assert!(pattern.matches(&stanza));

        let wrong_type = Element::new("iq").attr("type", "get").child(
            Element::new("agent_message").attr("xmlns", "urn:nodeward:agent"),
        );
        assert!(!pattern.matches(&wrong_type));

        let wrong_ns = Element::new("iq")
            .attr("type", "set")
            .child(Element::new("agent_message").attr("xmlns", "urn:other"));
        assert!(!pattern.matches(&wrong_ns));

        assert!(StanzaPattern::new("presence").matches(&Element::new("presence")));
        assert!(!StanzaPattern::new("presence").matches(&Element::new("message")));
    }

    #[test]
    fn test_handle_assigns_ids() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SessionHandle { tx };

        let id = handle.send(Element::new("message")).unwrap();
        assert!(!id.is_empty());
        assert_eq!(rx.try_recv().unwrap().get_attr("id"), Some(id.as_str()));

        let kept = handle.send(Element::new("iq").attr("id", "fixed")).unwrap();
        assert_eq!(kept, "fixed");

        drop(rx);
        assert!(matches!(
            handle.send(Element::new("message")),
            Err(SessionError::Closed)
        ));
    }

    #[test]
    fn test_error_condition() {
        let stanza = Element::new("iq").attr("type", "error").child(
            Element::new("error")
                .attr("code", "401")
                .child(Element::new("not-authorized").attr("xmlns", STANZA_ERROR_NS)),
        );
        assert_eq!(error_condition(&stanza), "not-authorized");

        let coded = Element::new("iq").child(Element::new("error").attr("code", "409"));
        assert_eq!(error_condition(&coded), "code 409");
        assert_eq!(error_condition(&Element::new("iq")), "unknown error");
    }

    #[test]
    fn test_iq_reply_addresses_sender() {
        let request = Element::new("iq")
            .attr("type", "get")
            .attr("id", "p1")
            .attr("from", "server@example.com");
        let reply = iq_reply(&request, "result");
        assert_eq!(
            reply.to_xml(),
            "<iq type=\"result\" to=\"server@example.com\" id=\"p1\"/>"
        );
    }
}
