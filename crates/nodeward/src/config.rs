//! Agent configuration.
//!
//! Layered: built-in defaults, then the TOML file, then `NODEWARD__*`
//! environment variables (`NODEWARD__XMPP__PASSWORD=...`).

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use nodeward_exec::{FactsPaths, RunOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::SessionConfig;

pub const APP_NAME: &str = "nodeward";
pub const ENV_PREFIX: &str = "NODEWARD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub xmpp: XmppConfig,
    pub plugins: PluginsConfig,
    pub facts: FactsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XmppConfig {
    /// `user@domain`, optionally with `/resource`.
    pub jid: String,
    pub password: String,
    /// Server to connect to; the JID's domain when unset.
    pub host: Option<String>,
    pub port: u16,
    pub resource: String,
    pub keepalive_secs: u64,
    pub initial_reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
    pub register_retry_secs: u64,
    pub auto_register: bool,
}

impl Default for XmppConfig {
    fn default() -> Self {
        Self {
            jid: String::new(),
            password: String::new(),
            host: None,
            port: 5222,
            resource: "nodeward".to_string(),
            keepalive_secs: 60,
            initial_reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 60,
            register_retry_secs: 3,
            auto_register: true,
        }
    }
}

impl XmppConfig {
    pub fn session_config(&self) -> Result<SessionConfig> {
        if self.jid.is_empty() {
            return Err(anyhow!("xmpp.jid is not set"));
        }
        let mut session = SessionConfig::new(&self.jid, self.password.clone())
            .with_context(|| format!("parsing xmpp.jid '{}'", self.jid))?;
        if !self.jid.contains('/') && !self.resource.is_empty() {
            session.resource = self.resource.clone();
        }
        if let Some(host) = self.host.as_deref().filter(|h| !h.is_empty()) {
            session.host = host.to_string();
        }
        session.port = self.port;
        session.keepalive = Duration::from_secs(self.keepalive_secs.max(1));
        session.initial_reconnect_delay = Duration::from_secs(self.initial_reconnect_delay_secs);
        session.max_reconnect_delay = Duration::from_secs(self.max_reconnect_delay_secs);
        session.register_retry_delay = Duration::from_secs(self.register_retry_secs);
        session.auto_register = self.auto_register;
        Ok(session)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Launch a plugin executable per command.
    Process,
    /// Call the built-in handlers inside the agent.
    InProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub dir: String,
    pub prefix: String,
    pub dispatch: DispatchMode,
    /// Kill commands running longer than this. Unbounded when unset.
    pub timeout_secs: Option<u64>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: "/usr/lib/nodeward/plugins".to_string(),
            prefix: "nodeward-plugin-".to_string(),
            dispatch: DispatchMode::Process,
            timeout_secs: None,
        }
    }
}

impl PluginsConfig {
    pub fn run_options(&self) -> RunOptions {
        RunOptions::default().with_timeout(self.timeout_secs.map(Duration::from_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactsConfig {
    pub env_file: String,
    pub facts_file: String,
}

impl Default for FactsConfig {
    fn default() -> Self {
        let paths = FactsPaths::default();
        Self {
            env_file: paths.env_file.display().to_string(),
            facts_file: paths.facts_file.display().to_string(),
        }
    }
}

impl FactsConfig {
    pub fn paths(&self) -> FactsPaths {
        FactsPaths {
            env_file: PathBuf::from(&self.env_file),
            facts_file: PathBuf::from(&self.facts_file),
        }
    }

    /// Variables telling plugin processes where the snapshots live.
    pub fn plugin_env(&self) -> HashMap<String, String> {
        HashMap::from([
            ("NODEWARD_ENV_FILE".to_string(), self.env_file.clone()),
            ("NODEWARD_FACTS_FILE".to_string(), self.facts_file.clone()),
        ])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Load the configuration; a missing file leaves the defaults in place.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("xmpp.port", 5222_i64)?
        .set_default("plugins.dispatch", "process")?
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("reading configuration from {}", path.display()))?;

    let mut config: AgentConfig = built
        .try_deserialize()
        .context("parsing configuration")?;

    config.plugins.dir = expand_str_path(&config.plugins.dir)?.display().to_string();
    config.facts.env_file = expand_str_path(&config.facts.env_file)?.display().to_string();
    config.facts.facts_file = expand_str_path(&config.facts.facts_file)?.display().to_string();

    Ok(config)
}

/// Write a commented default configuration file.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }
    let toml = toml::to_string_pretty(&AgentConfig::default())
        .context("serializing default config to TOML")?;
    let body = format!("# Configuration for {}\n# File: {}\n\n{}", APP_NAME, path.display(), toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_config_file() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}
