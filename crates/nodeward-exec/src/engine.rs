//! Command and file execution on top of [`ProcessRunner`].

use log::{debug, warn};
use nodeward_protocol::ExecutionResult;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::fsutil::chmod;
use crate::privilege::{chown_tree, is_root, run_as};
use crate::runner::{ProcessRunner, ProcessSpec, RunOptions};

/// A command line as sent by the server: a shell-style string or tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    Shell(String),
    Tokens(Vec<String>),
}

impl CommandLine {
    /// Single-string form. Tokens are joined with spaces, so a token holding
    /// several words is split again by [`CommandLine::to_argv`].
    pub fn to_shell_string(&self) -> String {
        match self {
            CommandLine::Shell(line) => line.clone(),
            CommandLine::Tokens(tokens) => tokens.join(" "),
        }
    }

    /// Split into argv with POSIX shell quoting rules.
    pub fn to_argv(&self) -> Result<Vec<String>, shell_words::ParseError> {
        shell_words::split(&self.to_shell_string())
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        CommandLine::Shell(line.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(line: String) -> Self {
        CommandLine::Shell(line)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(tokens: Vec<String>) -> Self {
        CommandLine::Tokens(tokens)
    }
}

impl From<&[&str]> for CommandLine {
    fn from(tokens: &[&str]) -> Self {
        CommandLine::Tokens(tokens.iter().map(|t| t.to_string()).collect())
    }
}

/// Everything about a run besides what to run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub stdin: Option<String>,
    pub run_as: Option<String>,
    pub workdir: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
}

impl ExecutionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn run_as(mut self, user: Option<String>) -> Self {
        self.run_as = user.filter(|u| !u.is_empty());
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, env: Option<HashMap<String, String>>) -> Self {
        self.env = env;
        self
    }

    fn to_spec(&self, argv: &[String]) -> Option<ProcessSpec> {
        let mut spec = ProcessSpec::from_argv(argv)?;
        spec.stdin = self.stdin.as_ref().map(|s| s.clone().into_bytes());
        spec.cwd = self.workdir.clone();
        spec.env = self.env.clone().unwrap_or_default();
        Some(spec)
    }
}

/// Runs commands and files, optionally as another user.
///
/// Neither operation returns an error: launch problems come back as exit code
/// 255 with the reason in stderr.
#[derive(Debug, Clone, Default)]
pub struct ExecutionEngine {
    runner: ProcessRunner,
}

impl ExecutionEngine {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    pub fn with_options(options: RunOptions) -> Self {
        Self::new(ProcessRunner::new(options))
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Run a command line.
    pub async fn execute_command(
        &self,
        command: impl Into<CommandLine>,
        request: &ExecutionRequest,
    ) -> ExecutionResult {
        let command = command.into();
        let argv = match &request.run_as {
            Some(user) => {
                if let Some(refused) = refuse_switch_without_root(user) {
                    return refused;
                }
                run_as(user, &command.to_shell_string())
            }
            None => match command.to_argv() {
                Ok(argv) => argv,
                Err(e) => {
                    warn!("Rejecting command line {:?}: {}", command, e);
                    return ExecutionResult::launch_failure(format!("invalid command line: {}", e));
                }
            },
        };
        debug!("Executing {:?} (run_as={:?})", argv, request.run_as);
        self.run_argv(&argv, request).await
    }

    /// Make `path` executable by its owner and run it.
    ///
    /// With a run-as user the file is first given to that user.
    pub async fn execute_file(&self, path: &Path, request: &ExecutionRequest) -> ExecutionResult {
        if let Err(e) = chmod(path, 0o700) {
            warn!("Cannot make {} executable: {}", path.display(), e);
            return ExecutionResult::launch_failure(format!("{}: {}", path.display(), e));
        }

        let file = path.to_string_lossy().into_owned();
        let argv = match &request.run_as {
            Some(user) => {
                if let Err(e) = chown_tree(path, user, None, true) {
                    return ExecutionResult::launch_failure(e);
                }
                if let Some(refused) = refuse_switch_without_root(user) {
                    return refused;
                }
                run_as(user, &shell_words::quote(&file))
            }
            None => vec![file],
        };
        debug!("Executing file {:?} (run_as={:?})", argv, request.run_as);
        self.run_argv(&argv, request).await
    }

    async fn run_argv(&self, argv: &[String], request: &ExecutionRequest) -> ExecutionResult {
        match request.to_spec(argv) {
            Some(spec) => self.runner.run(&spec).await,
            None => ExecutionResult::launch_failure("empty command line"),
        }
    }
}

/// `su` from an unprivileged agent would wait for a password that never comes.
fn refuse_switch_without_root(user: &str) -> Option<ExecutionResult> {
    if is_root() {
        return None;
    }
    warn!("Cannot run as {}: agent is not running as root", user);
    Some(ExecutionResult::launch_failure(format!(
        "running as {} requires root",
        user
    )))
}
