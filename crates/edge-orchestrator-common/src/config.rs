//! Configuration structures for the edge-orchestrator.
//!
//! This module defines configuration options for various components:
//! - [`OrchestratorConfig`]: Top-level configuration containing all settings
//! - [`ServerConfig`]: Front-door listener settings
//! - [`EngineConfig`]: Engine subprocess settings
//! - [`ProxyConfig`]: Header pipeline and upstream settings

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the engine binary path.
pub const ENGINE_PATH_ENV: &str = "EDGE_ORCHESTRATOR_ENGINE_PATH";

/// Environment variable naming a file to persist compiled configs to.
pub const CONFIG_DEBUG_ENV: &str = "EDGE_ORCHESTRATOR_CONFIG_DEBUG";

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Front-door listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Engine subprocess configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Header pipeline configuration.
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Front-door listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to listen on. Also used for the loopback server.
    #[serde(default = "defaults::host")]
    pub host: String,

    /// Port to listen on. `0` requests a fresh OS-assigned port on every
    /// engine restart; an explicit port is kept across restarts.
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            request_timeout_secs: defaults::request_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// Get the request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Engine subprocess configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Path to the engine binary.
    ///
    /// Overridden by the `EDGE_ORCHESTRATOR_ENGINE_PATH` environment variable.
    #[serde(default = "defaults::binary_path")]
    pub binary_path: String,

    /// How long the engine has to bind all sockets.
    #[serde(default = "defaults::readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,

    /// How long a replaced engine may keep serving in-flight requests.
    #[serde(default = "defaults::drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Port for the engine's inspector, if enabled.
    #[serde(default)]
    pub inspector_port: Option<u16>,

    /// Forward engine stdout/stderr to the log.
    #[serde(default = "defaults::verbose")]
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: defaults::binary_path(),
            readiness_timeout_ms: defaults::readiness_timeout_ms(),
            drain_timeout_ms: defaults::drain_timeout_ms(),
            inspector_port: None,
            verbose: defaults::verbose(),
        }
    }
}

impl EngineConfig {
    /// Resolve the engine binary, honouring the environment override.
    pub fn resolve_binary_path(&self) -> PathBuf {
        std::env::var_os(ENGINE_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map_or_else(|| PathBuf::from(&self.binary_path), PathBuf::from)
    }

    /// Get the readiness timeout as a `Duration`.
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    /// Get the drain timeout as a `Duration`.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// File compiled configs are persisted to, if the debug variable is set.
pub fn config_debug_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_DEBUG_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Header pipeline and upstream configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Base URL requests are rewritten to before reaching workers.
    #[serde(default)]
    pub upstream: Option<String>,

    /// Secret a trusted reverse proxy sends in `MF-Proxy-Shared-Secret`.
    #[serde(default)]
    pub unsafe_proxy_shared_secret: Option<String>,

    /// Strip `CF-Connecting-IP` from worker-initiated requests.
    #[serde(default = "defaults::strip_cf_connecting_ip")]
    pub strip_cf_connecting_ip: bool,

    /// The `cf` object returned by `get_cf()`.
    #[serde(default)]
    pub cf: Option<serde_json::Value>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream: None,
            unsafe_proxy_shared_secret: None,
            strip_cf_connecting_ip: defaults::strip_cf_connecting_ip(),
            cf: None,
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub fn host() -> String {
        "127.0.0.1".to_string()
    }

    pub const fn port() -> u16 {
        8787
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub fn binary_path() -> String {
        "workerd".to_string()
    }

    pub const fn readiness_timeout_ms() -> u64 {
        10_000
    }

    pub const fn drain_timeout_ms() -> u64 {
        30_000
    }

    pub const fn verbose() -> bool {
        true
    }

    pub const fn strip_cf_connecting_ip() -> bool {
        true
    }
}
