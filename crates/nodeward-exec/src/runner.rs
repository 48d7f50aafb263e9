//! Child process runner with live output capture.
//!
//! Each [`ProcessRunner::run`] call owns exactly one child and one drain task.
//! The drain task owns the stdout/stderr pipes and the accumulation buffers;
//! it polls both pipes on a fixed interval with non-blocking reads, keeps going
//! for a bounded grace period after the child exits, and hands the captured
//! bytes back through its `JoinHandle`.

use futures::FutureExt;
use log::{debug, info, warn};
use nodeward_protocol::{EXIT_LAUNCH_FAILURE, EXIT_TIMEOUT, ExecutionResult};
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

use crate::ansi::strip_ansi;
use crate::env::merged_environment;

const READ_CHUNK: usize = 8192;

/// Tunables for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// How often the drain task polls the output pipes.
    pub poll_interval: Duration,
    /// How long to keep draining after the child has exited.
    pub grace_period: Duration,
    /// Mirror captured output to the agent's own stdout/stderr.
    pub echo: bool,
    /// Kill the child once it has run this long. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Report the convergence "changes applied" status (2) as success.
    pub converge: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            grace_period: Duration::from_secs(1),
            echo: false,
            timeout: None,
            converge: false,
        }
    }
}

impl RunOptions {
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_converge(mut self, converge: bool) -> Self {
        self.converge = converge;
        self
    }
}

/// What to launch: program, arguments, stdin payload, working directory and
/// environment overrides.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub cwd: Option<PathBuf>,
    /// Layered over the agent's own environment; these values win.
    pub env: HashMap<String, String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Build a spec from an argv vector. Returns `None` for an empty vector.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runs child processes and captures their output.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    options: RunOptions,
}

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut(Duration),
    Failed(std::io::Error),
}

impl ProcessRunner {
    pub fn new(options: RunOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run `spec` to completion.
    ///
    /// Never fails: a process that cannot be launched yields exit code 255
    /// with the reason in stderr.
    pub async fn run(&self, spec: &ProcessSpec) -> ExecutionResult {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(merged_environment(&spec.env))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.cwd {
            cmd.current_dir(std::path::absolute(dir).unwrap_or_else(|_| dir.clone()));
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to launch '{}': {}", spec.display(), e);
                return ExecutionResult::launch_failure(format!(
                    "failed to launch {}: {}",
                    spec.program, e
                ));
            }
        };

        let pid = child.id().unwrap_or_default();
        debug!("Spawned '{}' (pid {})", spec.display(), pid);

        let (exited_tx, exited_rx) = oneshot::channel();
        let drain = tokio::spawn(drain_output(
            child.stdout.take(),
            child.stderr.take(),
            exited_rx,
            self.options.clone(),
        ));

        let feeder = match (child.stdin.take(), spec.stdin.clone()) {
            (Some(mut stdin), Some(payload)) => Some(tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!("Writing stdin of pid {} failed: {}", pid, e);
                }
                // Dropping the handle closes the pipe so the child sees EOF.
                drop(stdin);
            })),
            _ => None,
        };

        let outcome = self.wait(&mut child).await;
        let _ = exited_tx.send(());
        if let Some(feeder) = feeder {
            feeder.abort();
        }

        let captured = match drain.await {
            Ok(captured) => captured,
            Err(e) => {
                warn!("Output drain for pid {} failed: {}", pid, e);
                Captured::default()
            }
        };
        let stdout = strip_ansi(&String::from_utf8_lossy(&captured.stdout));
        let mut stderr = strip_ansi(&String::from_utf8_lossy(&captured.stderr));

        let result = match outcome {
            WaitOutcome::Exited(status) => {
                let code = exit_code(status);
                debug!("pid {} exited with code {}", pid, code);
                ExecutionResult::new(code, stdout, stderr)
            }
            WaitOutcome::TimedOut(limit) => {
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!(
                    "process killed after exceeding timeout of {}s\n",
                    limit.as_secs_f64()
                ));
                ExecutionResult::new(EXIT_TIMEOUT, stdout, stderr)
            }
            WaitOutcome::Failed(e) => {
                warn!("Waiting for pid {} failed: {}", pid, e);
                stderr.push_str(&format!("failed to wait for {}: {}", spec.program, e));
                ExecutionResult::new(EXIT_LAUNCH_FAILURE, stdout, stderr)
            }
        };

        if self.options.converge {
            result.converged()
        } else {
            result
        }
    }

    async fn wait(&self, child: &mut Child) -> WaitOutcome {
        let waited = match self.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    info!(
                        "Killing pid {:?} after {}s timeout",
                        child.id(),
                        limit.as_secs_f64()
                    );
                    // kill() also reaps the child.
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill timed out process: {}", e);
                    }
                    return WaitOutcome::TimedOut(limit);
                }
            },
            None => child.wait().await,
        };

        match waited {
            Ok(status) => WaitOutcome::Exited(status),
            Err(e) => WaitOutcome::Failed(e),
        }
    }
}

/// Map an exit status to a code; signals become `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => EXIT_LAUNCH_FAILURE,
    }
}

/// Raw bytes captured by a drain task.
#[derive(Debug, Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
enum Mirror {
    Stdout,
    Stderr,
}

impl Mirror {
    fn write(self, chunk: &[u8]) {
        let text = strip_ansi(&String::from_utf8_lossy(chunk));
        let written = match self {
            Mirror::Stdout => std::io::stdout().write_all(text.as_bytes()),
            Mirror::Stderr => std::io::stderr().write_all(text.as_bytes()),
        };
        if let Err(e) = written {
            debug!("Echoing child output failed: {}", e);
        }
    }
}

struct OutputPipe<R> {
    reader: Option<R>,
    mirror: Mirror,
}

impl<R: AsyncRead + Unpin> OutputPipe<R> {
    fn new(reader: Option<R>, mirror: Mirror) -> Self {
        Self { reader, mirror }
    }

    fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    /// Read everything available right now without waiting.
    fn drain_available(&mut self, sink: &mut Vec<u8>, echo: bool) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).now_or_never() {
                None => return,
                Some(Ok(0)) => {
                    self.reader = None;
                    return;
                }
                Some(Ok(n)) => {
                    sink.extend_from_slice(&chunk[..n]);
                    if echo {
                        self.mirror.write(&chunk[..n]);
                    }
                }
                Some(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Some(Err(e)) => {
                    debug!("Reading child output failed: {}", e);
                    self.reader = None;
                    return;
                }
            }
        }
    }
}

async fn drain_output(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    mut exited: oneshot::Receiver<()>,
    options: RunOptions,
) -> Captured {
    let mut captured = Captured::default();
    let mut out = OutputPipe::new(stdout, Mirror::Stdout);
    let mut err = OutputPipe::new(stderr, Mirror::Stderr);

    let mut ticker = tokio::time::interval(options.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            // Also fires if the runner went away without signalling.
            _ = &mut exited, if deadline.is_none() => {
                deadline = Some(Instant::now() + options.grace_period);
            }
        }

        out.drain_available(&mut captured.stdout, options.echo);
        err.drain_available(&mut captured.stderr, options.echo);

        if out.is_closed() && err.is_closed() {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            debug!("Grace period elapsed with output pipes still open; dropping late output");
            break;
        }
    }

    captured
}
