//! Engine process supervision.
//!
//! The [`ProcessSupervisor`] owns at most one live [`RuntimeProcess`] at a
//! time. Reconfigurations are serialized through a mutex, so restarts never
//! interleave. Each process is a *generation*: handles obtained from one
//! generation stop working as soon as it is replaced.
//!
//! # State machine
//!
//! ```text
//!   Stopped ──apply──▶ Starting ──ready──▶ Ready ──replace/dispose──▶ Draining ──▶ Stopped
//!                          │
//!                          └──failure──▶ Stopped
//! ```
//!
//! A restart starts the new process first and stops the old one once the new
//! one is ready, unless the new configuration asks for an explicit port the
//! old process still holds. Then the old process is stopped first.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use edge_orchestrator_common::{EngineConfig, OrchestratorError, config::config_debug_path};
use edge_orchestrator_core::RuntimeConfig;
use edge_orchestrator_core::runtime_config::{PROXY_SOCKET, entry_socket_name};

use crate::process::{EngineInstance, EngineLauncher, LaunchOptions};

/// Lifecycle state of an engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Being spawned; not yet ready.
    Starting,
    /// Serving the current configuration.
    Ready,
    /// Replaced; finishing in-flight requests.
    Draining,
    /// Gone.
    Stopped,
}

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Passed to the launcher.
    pub launch: LaunchOptions,
    /// Bound on waiting for in-flight requests of a replaced process.
    pub drain_timeout: Duration,
    /// Where to persist each compiled configuration, if anywhere.
    pub config_debug_path: Option<PathBuf>,
}

impl SupervisorOptions {
    /// Options from the engine configuration and the environment.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            launch: LaunchOptions::from_config(config),
            drain_timeout: config.drain_timeout(),
            config_debug_path: config_debug_path(),
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// One generation of the engine.
pub struct RuntimeProcess {
    generation: u64,
    config: Arc<RuntimeConfig>,
    pid: Option<u32>,
    sockets: std::collections::BTreeMap<String, SocketAddr>,
    inspector: Option<SocketAddr>,
    state: Mutex<ProcessState>,
    inflight: AtomicUsize,
    drained: Notify,
    instance: tokio::sync::Mutex<Option<Box<dyn EngineInstance>>>,
}

impl RuntimeProcess {
    fn new(generation: u64, config: RuntimeConfig, instance: Box<dyn EngineInstance>) -> Self {
        Self {
            generation,
            config: Arc::new(config),
            pid: instance.pid(),
            sockets: instance.sockets().clone(),
            inspector: instance.inspector(),
            state: Mutex::new(ProcessState::Ready),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
            instance: tokio::sync::Mutex::new(Some(instance)),
        }
    }

    /// Generation number; strictly increasing across restarts.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The configuration this process runs.
    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    /// OS process id, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current state.
    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// Returns `true` while this is the serving generation.
    pub fn is_live(&self) -> bool {
        self.state() == ProcessState::Ready
    }

    /// Bound address of a socket.
    pub fn socket(&self, name: &str) -> Option<SocketAddr> {
        self.sockets.get(name).copied()
    }

    /// Address of a worker's entry socket.
    pub fn entry_addr(&self, worker: &str) -> Option<SocketAddr> {
        self.socket(&entry_socket_name(worker))
    }

    /// Address of the binding RPC socket.
    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        self.socket(PROXY_SOCKET)
    }

    /// Inspector address, if enabled.
    pub fn inspector(&self) -> Option<SocketAddr> {
        self.inspector
    }

    /// Number of requests currently holding this process.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Register a request against this process.
    ///
    /// Returns `None` once the process has stopped. Draining processes still
    /// accept requests that were already routed to them.
    pub fn try_begin_request(self: &Arc<Self>) -> Option<InflightGuard> {
        if self.state() == ProcessState::Stopped {
            return None;
        }
        self.inflight.fetch_add(1, Ordering::SeqCst);
        Some(InflightGuard {
            process: Arc::clone(self),
        })
    }

    fn mark_draining(&self) {
        let mut state = self.state.lock();
        if *state == ProcessState::Ready {
            *state = ProcessState::Draining;
        }
    }

    /// Wait until no request holds this process, up to `timeout`.
    async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inflight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Stop the process, draining first when `drain` is set.
    async fn stop(&self, drain: Option<Duration>) {
        self.mark_draining();

        if let Some(timeout) = drain {
            if !self.drain(timeout).await {
                warn!(
                    generation = self.generation,
                    inflight = self.inflight(),
                    "Drain timeout elapsed, stopping engine process with requests in flight"
                );
            }
        }

        // Taking the instance makes stop idempotent
        let instance = self.instance.lock().await.take();
        if let Some(mut instance) = instance {
            instance.shutdown().await;
            debug!(generation = self.generation, pid = ?self.pid, "Engine process stopped");
        }
        *self.state.lock() = ProcessState::Stopped;
    }
}

impl fmt::Debug for RuntimeProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeProcess")
            .field("generation", &self.generation)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("sockets", &self.sockets)
            .field("inflight", &self.inflight())
            .finish_non_exhaustive()
    }
}

/// Keeps a process from being stopped before a request finishes.
#[derive(Debug)]
pub struct InflightGuard {
    process: Arc<RuntimeProcess>,
}

impl InflightGuard {
    /// The process the request was routed to.
    pub fn process(&self) -> &Arc<RuntimeProcess> {
        &self.process
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.process.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.process.drained.notify_waiters();
        }
    }
}

/// What `ready()` resolves to.
#[derive(Debug, Clone)]
pub enum ReadyState {
    /// A process is starting.
    Pending,
    /// The most recently started process is serving.
    Ready(Arc<RuntimeProcess>),
    /// The most recent start failed.
    Failed(OrchestratorError),
    /// The supervisor was disposed.
    Disposed,
}

/// Result of [`ProcessSupervisor::apply`].
#[derive(Debug, Clone)]
pub struct Applied {
    /// The serving process.
    pub process: Arc<RuntimeProcess>,
    /// Whether a new process was started.
    pub restarted: bool,
}

/// Owns the engine process lifecycle.
pub struct ProcessSupervisor {
    launcher: Arc<dyn EngineLauncher>,
    options: SupervisorOptions,
    restart: tokio::sync::Mutex<()>,
    current: RwLock<Option<Arc<RuntimeProcess>>>,
    ready: watch::Sender<ReadyState>,
    next_generation: AtomicU64,
    disposed: AtomicBool,
}

impl ProcessSupervisor {
    /// Create a supervisor; nothing runs until [`apply`](Self::apply).
    pub fn new(launcher: Arc<dyn EngineLauncher>, options: SupervisorOptions) -> Self {
        let (ready, _) = watch::channel(ReadyState::Pending);
        Self {
            launcher,
            options,
            restart: tokio::sync::Mutex::new(()),
            current: RwLock::new(None),
            ready,
            next_generation: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    /// Overall state.
    pub fn state(&self) -> ProcessState {
        if self.disposed.load(Ordering::SeqCst) {
            return ProcessState::Stopped;
        }
        if matches!(*self.ready.borrow(), ReadyState::Pending) {
            return ProcessState::Starting;
        }
        self.current
            .read()
            .as_ref()
            .map_or(ProcessState::Stopped, |process| process.state())
    }

    /// Returns `true` once [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Wait for the most recently started process.
    ///
    /// # Errors
    ///
    /// Returns the startup failure of the most recent start, or `Disposed`
    /// if the supervisor is disposed before or while waiting.
    pub async fn ready(&self) -> Result<Arc<RuntimeProcess>, OrchestratorError> {
        let mut receiver = self.ready.subscribe();
        let state = receiver
            .wait_for(|state| !matches!(state, ReadyState::Pending))
            .await
            .map(|state| state.clone())
            .map_err(|_| OrchestratorError::Disposed)?;

        match state {
            ReadyState::Ready(process) => Ok(process),
            ReadyState::Failed(err) => Err(err),
            ReadyState::Pending | ReadyState::Disposed => Err(OrchestratorError::Disposed),
        }
    }

    /// The serving process, without waiting.
    pub fn current(&self) -> Result<Arc<RuntimeProcess>, OrchestratorError> {
        if self.is_disposed() {
            return Err(OrchestratorError::Disposed);
        }
        self.current
            .read()
            .clone()
            .filter(|process| process.state() != ProcessState::Stopped)
            .ok_or_else(|| OrchestratorError::startup("Engine process is not running"))
    }

    /// Run `config`, restarting the engine only if it differs from the
    /// running configuration.
    #[instrument(skip_all)]
    pub async fn apply(&self, config: RuntimeConfig) -> Result<Applied, OrchestratorError> {
        let _restart = self.restart.lock().await;
        if self.is_disposed() {
            return Err(OrchestratorError::Disposed);
        }

        let previous = self.current.read().clone();
        if let Some(previous) = &previous {
            if previous.is_live() && previous.config().to_bytes() == config.to_bytes() {
                debug!(
                    generation = previous.generation(),
                    "Configuration unchanged, keeping engine process"
                );
                return Ok(Applied {
                    process: Arc::clone(previous),
                    restarted: false,
                });
            }
        }

        self.publish(ReadyState::Pending);
        self.write_debug_config(&config).await;

        let stop_first = previous
            .as_ref()
            .is_some_and(|previous| self.holds_requested_port(previous, &config));
        if stop_first {
            if let Some(previous) = &previous {
                info!(
                    generation = previous.generation(),
                    "Stopping engine process first to release its explicit ports"
                );
                previous.stop(Some(self.options.drain_timeout)).await;
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let launched = self.launcher.launch(&config, &self.options.launch).await;

        let instance = match launched {
            Ok(instance) => instance,
            Err(err) => {
                error!(generation, %err, "Engine process failed to start");
                let previous = self.current.write().take();
                if let Some(previous) = previous {
                    previous.stop(None).await;
                }
                self.publish(ReadyState::Failed(err.clone()));
                return Err(err);
            }
        };

        let process = Arc::new(RuntimeProcess::new(generation, config, instance));
        if let Some(previous) = &previous {
            previous.mark_draining();
        }
        *self.current.write() = Some(Arc::clone(&process));

        if !self.publish(ReadyState::Ready(Arc::clone(&process))) {
            // Disposed while starting. dispose() stops the new process once
            // it gets the restart lock; the replaced one is ours to stop.
            if let Some(previous) = previous {
                previous.stop(None).await;
            }
            return Err(OrchestratorError::Disposed);
        }
        info!(
            generation,
            pid = ?process.pid(),
            sockets = process.sockets.len(),
            "Engine process ready"
        );

        if !stop_first {
            if let Some(previous) = previous {
                previous.stop(Some(self.options.drain_timeout)).await;
            }
        }

        Ok(Applied {
            process,
            restarted: true,
        })
    }

    /// Stop the engine and poison every outstanding handle.
    ///
    /// Concurrent and later `ready()` calls fail with `Disposed`. In-flight
    /// requests are not drained.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.send_replace(ReadyState::Disposed);

        let _restart = self.restart.lock().await;
        let current = self.current.write().take();
        if let Some(process) = current {
            process.stop(None).await;
        }
        info!("Engine supervisor disposed");
    }

    /// Publish a ready state unless disposal already won.
    fn publish(&self, next: ReadyState) -> bool {
        self.ready.send_if_modified(|state| {
            if matches!(state, ReadyState::Disposed) {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    fn holds_requested_port(&self, previous: &RuntimeProcess, config: &RuntimeConfig) -> bool {
        let socket_conflict = config.explicit_ports().iter().any(|(_, port)| {
            previous.sockets.values().any(|addr| addr.port() == *port)
        });
        let inspector_conflict =
            self.options.launch.inspector_port.is_some() && previous.inspector().is_some();
        socket_conflict || inspector_conflict
    }

    async fn write_debug_config(&self, config: &RuntimeConfig) {
        let Some(path) = &self.options.config_debug_path else {
            return;
        };
        match tokio::fs::write(path, config.to_pretty_json()).await {
            Ok(()) => debug!(path = %path.display(), "Wrote runtime configuration"),
            Err(err) => warn!(path = %path.display(), %err, "Failed to write runtime configuration"),
        }
    }
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("state", &self.state())
            .field("current", &*self.current.read())
            .finish_non_exhaustive()
    }
}
