//! Engine output forwarding.
//!
//! Lines the engine writes that aren't control messages are re-emitted
//! through `tracing` under the `engine` target: stdout at `info`, stderr at
//! `warn`. Once a process has been told to shut down its output is
//! silenced, so an interrupted orchestrator doesn't print anything after the
//! signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Forwards one engine process's output.
///
/// Cloning shares the silence flag and the remembered error line.
#[derive(Debug, Clone)]
pub struct EngineLog {
    pid: Option<u32>,
    verbose: bool,
    quiet: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl EngineLog {
    /// Create a forwarder; `verbose = false` only remembers stderr.
    pub fn new(pid: Option<u32>, verbose: bool) -> Self {
        Self {
            pid,
            verbose,
            quiet: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Forward a line.
    pub fn log(&self, stream: Stream, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }

        if stream == Stream::Stderr {
            *self.last_error.lock() = Some(line.to_string());
        }

        if !self.verbose || self.is_silenced() {
            return;
        }

        match stream {
            Stream::Stdout => info!(target: "engine", pid = ?self.pid, "{}", line),
            Stream::Stderr => warn!(target: "engine", pid = ?self.pid, "{}", line),
        }
    }

    /// Stop forwarding; called when shutdown begins.
    pub fn silence(&self) {
        self.quiet.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`silence`](Self::silence) has been called.
    pub fn is_silenced(&self) -> bool {
        self.quiet.load(Ordering::SeqCst)
    }

    /// The most recent non-empty stderr line.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}
