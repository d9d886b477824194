//! Engine process launching.
//!
//! The [`EngineLauncher`] trait is the seam between the supervisor and the
//! execution engine. [`ProcessLauncher`] is the production implementation:
//! it spawns the engine binary, feeds it the compiled configuration and
//! waits for it to report every socket it was asked to bind.
//!
//! # Control protocol
//!
//! ```text
//! <binary> serve - --control-stdout [--inspector-addr 127.0.0.1:<port>]
//!
//! stdin   <- RuntimeConfig as JSON, then EOF
//! stdout  -> {"event":"listen","socket":"entry:api","port":50123}
//!            {"event":"listen-inspector","port":9229}
//!            ... anything else is a log line
//! stderr  -> log lines
//! ```

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use edge_orchestrator_common::{EngineConfig, OrchestratorError};
use edge_orchestrator_core::RuntimeConfig;
use edge_orchestrator_core::runtime_config::{LOCAL_HOST, PROXY_SOCKET};

use crate::logging::{EngineLog, Stream};

/// How long to wait for trailing stderr after the engine exits early.
const STDERR_GRACE: Duration = Duration::from_millis(200);

/// Per-launch settings.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Bound on the time between spawn and readiness.
    pub readiness_timeout: Duration,
    /// Port for the engine's inspector, if enabled.
    pub inspector_port: Option<u16>,
    /// Forward engine output to the log.
    pub verbose: bool,
}

impl LaunchOptions {
    /// Launch options from the engine configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            readiness_timeout: config.readiness_timeout(),
            inspector_port: config.inspector_port,
            verbose: config.verbose,
        }
    }
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Starts engine instances.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Start an engine running `config` and wait until it is ready.
    ///
    /// # Errors
    ///
    /// Returns `StartupFailure` if the engine can't be spawned, exits early
    /// or doesn't become ready within `options.readiness_timeout`.
    async fn launch(
        &self,
        config: &RuntimeConfig,
        options: &LaunchOptions,
    ) -> Result<Box<dyn EngineInstance>, OrchestratorError>;
}

/// A running, ready engine.
#[async_trait]
pub trait EngineInstance: Send + Sync {
    /// OS process id, if the instance is a process.
    fn pid(&self) -> Option<u32>;

    /// Bound address of every configured socket, by socket name.
    fn sockets(&self) -> &BTreeMap<String, SocketAddr>;

    /// Inspector address, if enabled.
    fn inspector(&self) -> Option<SocketAddr>;

    /// Stop the engine and release everything it holds.
    async fn shutdown(&mut self);
}

/// A control message printed by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ControlEvent {
    /// A configured socket is listening.
    Listen {
        /// Socket name.
        socket: String,
        /// Bound port.
        port: u16,
    },
    /// The inspector is listening.
    ListenInspector {
        /// Bound port.
        port: u16,
    },
}

impl ControlEvent {
    /// Parse a stdout line; `None` for ordinary log output.
    pub fn parse(line: &str) -> Option<Self> {
        if !line.trim_start().starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

/// Launches the engine binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
}

impl ProcessLauncher {
    /// Launch `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Launch the binary named by the configuration or its environment
    /// override.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.resolve_binary_path())
    }

    /// The engine binary.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, options: &LaunchOptions) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(["serve", "-", "--control-stdout"]);
        if let Some(port) = options.inspector_port {
            command
                .arg("--inspector-addr")
                .arg(format!("{LOCAL_HOST}:{port}"));
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(
        &self,
        config: &RuntimeConfig,
        options: &LaunchOptions,
    ) -> Result<Box<dyn EngineInstance>, OrchestratorError> {
        let mut child = self.command(options).spawn().map_err(|err| {
            OrchestratorError::startup_io(
                format!("Failed to spawn engine \"{}\"", self.binary.display()),
                err,
            )
        })?;
        let pid = child.id();
        let log = EngineLog::new(pid, options.verbose);
        info!(pid = ?pid, binary = %self.binary.display(), "Spawned engine process");

        let stdin = child.stdin.take();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(OrchestratorError::startup("Engine stdio was not captured"));
        };
        let mut stderr_task = tokio::spawn(forward(
            BufReader::new(stderr).lines(),
            log.clone(),
            Stream::Stderr,
        ));
        let mut stdout = BufReader::new(stdout).lines();

        // An engine that never drains stdin must not outlive the deadline
        let waited = tokio::time::timeout(options.readiness_timeout, async {
            if let Some(stdin) = stdin {
                send_config(stdin, config).await;
            }
            wait_ready(&mut child, &mut stdout, config, &log, options.inspector_port.is_some()).await
        })
        .await;

        let failure = match waited {
            Ok(Ok((sockets, inspector))) => {
                let stdout_task = tokio::spawn(forward(stdout, log.clone(), Stream::Stdout));
                return Ok(Box::new(EngineProcess {
                    child,
                    pid,
                    sockets,
                    inspector,
                    log,
                    tasks: vec![stdout_task, stderr_task],
                }));
            }
            Ok(Err(WaitError::Exited(status))) => {
                let status = match status {
                    Some(status) => Some(status),
                    None => tokio::time::timeout(STDERR_GRACE, child.wait())
                        .await
                        .ok()
                        .and_then(Result::ok),
                };
                // Let the stderr task catch up so the message has its last line
                let _ = tokio::time::timeout(STDERR_GRACE, &mut stderr_task).await;
                exited_error(status, log.last_error())
            }
            Ok(Err(WaitError::Failed(err))) => err,
            Err(_) => OrchestratorError::startup(format!(
                "Engine did not become ready within {}ms",
                options.readiness_timeout.as_millis()
            )),
        };

        log.silence();
        stderr_task.abort();
        if let Err(err) = child.start_kill() {
            debug!(%err, "Engine process already exited");
        }
        let _ = child.wait().await;
        Err(failure)
    }
}

/// Write the configuration and close the pipe.
async fn send_config(mut stdin: ChildStdin, config: &RuntimeConfig) {
    // An engine that exits immediately closes the pipe; the wait that
    // follows reports that with a better message.
    if let Err(err) = stdin.write_all(&config.to_bytes()).await {
        debug!(%err, "Failed to write configuration to engine stdin");
    }
}

enum WaitError {
    Exited(Option<ExitStatus>),
    Failed(OrchestratorError),
}

type Ready = (BTreeMap<String, SocketAddr>, Option<SocketAddr>);

async fn wait_ready(
    child: &mut Child,
    stdout: &mut Lines<BufReader<ChildStdout>>,
    config: &RuntimeConfig,
    log: &EngineLog,
    want_inspector: bool,
) -> Result<Ready, WaitError> {
    let mut sockets = BTreeMap::new();
    let mut inspector = None;

    while sockets.len() < config.sockets.len() || (want_inspector && inspector.is_none()) {
        tokio::select! {
            line = stdout.next_line() => {
                let Ok(Some(line)) = line else {
                    // stdout closed: the process is on its way out
                    return Err(WaitError::Exited(None));
                };
                match ControlEvent::parse(&line) {
                    Some(ControlEvent::Listen { socket, port }) => {
                        if let Some(socket_config) = config.socket(&socket) {
                            let addr = resolve(&socket_config.host, port)
                                .await
                                .map_err(WaitError::Failed)?;
                            debug!(socket = %socket, %addr, "Engine socket listening");
                            sockets.insert(socket, addr);
                        } else {
                            warn!(socket = %socket, "Engine reported an unknown socket");
                        }
                    }
                    Some(ControlEvent::ListenInspector { port }) => {
                        inspector = Some(SocketAddr::from(([127, 0, 0, 1], port)));
                    }
                    None => log.log(Stream::Stdout, &line),
                }
            }
            status = child.wait() => return Err(WaitError::Exited(status.ok())),
        }
    }

    let proxy = sockets.get(PROXY_SOCKET).copied().ok_or_else(|| {
        WaitError::Failed(OrchestratorError::startup("Engine did not report the proxy socket"))
    })?;
    TcpStream::connect(proxy).await.map_err(|err| {
        WaitError::Failed(OrchestratorError::startup_io(
            format!("Engine proxy socket {proxy} refused connection"),
            err,
        ))
    })?;

    Ok((sockets, inspector))
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, OrchestratorError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|err| OrchestratorError::startup_io(format!("Failed to resolve {host}:{port}"), err))?;
    addrs
        .next()
        .ok_or_else(|| OrchestratorError::startup(format!("{host}:{port} resolved to nothing")))
}

/// Build the error for an engine that exited before becoming ready.
///
/// Bind failures keep their OS error kind so callers can tell a port
/// conflict apart from other failures.
fn exited_error(status: Option<ExitStatus>, last_error: Option<String>) -> OrchestratorError {
    let status = status.map_or_else(|| "unknown status".to_string(), |s| s.to_string());
    let Some(line) = last_error else {
        return OrchestratorError::startup(format!("Engine exited ({status}) before becoming ready"));
    };

    let cause = format!("Engine exited ({status}) before becoming ready");
    if line.to_ascii_lowercase().contains("address already in use") {
        OrchestratorError::startup_io(cause, io::Error::new(io::ErrorKind::AddrInUse, line))
    } else {
        OrchestratorError::startup(format!("{cause}: {line}"))
    }
}

async fn forward<R>(mut lines: Lines<R>, log: EngineLog, stream: Stream)
where
    R: AsyncBufRead + Unpin,
{
    while let Ok(Some(line)) = lines.next_line().await {
        log.log(stream, &line);
    }
}

/// A ready engine child process.
///
/// Dropping the handle kills the child and stops its output forwarding.
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
    pid: Option<u32>,
    sockets: BTreeMap<String, SocketAddr>,
    inspector: Option<SocketAddr>,
    log: EngineLog,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl EngineInstance for EngineProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn sockets(&self) -> &BTreeMap<String, SocketAddr> {
        &self.sockets
    }

    fn inspector(&self) -> Option<SocketAddr> {
        self.inspector
    }

    async fn shutdown(&mut self) {
        self.log.silence();
        if let Err(err) = self.child.start_kill() {
            debug!(pid = ?self.pid, %err, "Engine process already exited");
        }
        match self.child.wait().await {
            Ok(status) => debug!(pid = ?self.pid, %status, "Engine process exited"),
            Err(err) => warn!(pid = ?self.pid, %err, "Failed to reap engine process"),
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.log.silence();
        for task in &self.tasks {
            task.abort();
        }
    }
}
