//! The compiled runtime configuration consumed by the engine.
//!
//! This document is self-contained: every reference between workers has been
//! resolved to a service name, every default has been filled in, and every
//! collection has a deterministic order. Two configurations are equal exactly
//! when their serialized bytes are equal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use edge_orchestrator_common::ScriptSource;

use crate::routes::RouteEntry;

/// Name of the engine-internal service answering binding RPC.
pub const PROXY_SERVICE: &str = "core:proxy";

/// Name of the socket serving binding RPC.
pub const PROXY_SOCKET: &str = "core:proxy";

/// Host every engine-internal socket binds to.
pub const LOCAL_HOST: &str = "127.0.0.1";

/// Service name for a user worker.
pub fn worker_service_name(worker: &str) -> String {
    format!("core:user:{worker}")
}

/// Socket name for a worker's routed entry socket.
pub fn entry_socket_name(worker: &str) -> String {
    format!("entry:{worker}")
}

/// Service name for a worker's outbound `fetch()` target on the loopback server.
pub fn outbound_service_name(worker: &str) -> String {
    format!("outbound:{worker}")
}

/// Service name for a binding backed by its own service.
pub fn binding_service_name(worker: &str, binding: &str) -> String {
    format!("binding:{worker}:{binding}")
}

/// Path on the loopback server answering a loopback service.
pub fn loopback_path(service: &str) -> String {
    format!("/core/loopback/{service}")
}

/// Socket name for a direct socket.
pub fn direct_socket_name(worker: &str, entrypoint: Option<&str>) -> String {
    format!("direct:{worker}:{}", entrypoint.unwrap_or("default"))
}

/// The complete compiled configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Name of the entrypoint worker.
    pub entrypoint: String,

    /// Routable user workers, in definition order.
    pub workers: Vec<String>,

    /// Every service the engine must run, sorted by name.
    pub services: Vec<ServiceConfig>,

    /// Every socket the engine must bind, sorted by name.
    pub sockets: Vec<SocketConfig>,

    /// Route table, most specific first.
    pub routes: Vec<RouteEntry>,

    /// Per-worker upstream base URLs.
    pub upstreams: BTreeMap<String, String>,

    /// Workers that only implement wrapped bindings.
    pub wrapped_only: Vec<String>,

    /// Address of the loopback server, when one is running.
    pub loopback: Option<String>,
}

impl RuntimeConfig {
    /// Serialize to the canonical byte form.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Every type here serializes infallibly: no non-string map keys
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Serialize for humans.
    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Look up a user worker's configuration.
    pub fn worker(&self, name: &str) -> Option<&WorkerConfig> {
        match &self.service(&worker_service_name(name))?.kind {
            ServiceKind::Worker(worker) => Some(worker),
            _ => None,
        }
    }

    /// Names of routable user workers, in definition order.
    pub fn worker_names(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(String::as_str)
    }

    /// Look up a socket by name.
    pub fn socket(&self, name: &str) -> Option<&SocketConfig> {
        self.sockets.iter().find(|s| s.name == name)
    }

    /// Explicit (non-zero) ports requested by sockets.
    pub fn explicit_ports(&self) -> Vec<(String, u16)> {
        self.sockets
            .iter()
            .filter(|s| s.port != 0)
            .map(|s| (s.host.clone(), s.port))
            .collect()
    }
}

/// A named service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique service name.
    pub name: String,
    /// What the service is.
    #[serde(flatten)]
    pub kind: ServiceKind,
}

/// The kinds of service the engine runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceKind {
    /// A user worker.
    Worker(WorkerConfig),
    /// An external HTTP server.
    External {
        /// `host:port`.
        address: String,
        /// `http` or `https`.
        scheme: String,
    },
    /// A directory served over HTTP.
    Disk {
        /// Directory path.
        path: String,
        /// Whether writes are allowed.
        writable: bool,
    },
    /// A route on the loopback server.
    Loopback {
        /// Path prefix on the loopback server.
        path: String,
    },
    /// The engine's binding RPC endpoint.
    Proxy,
}

/// A compiled user worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name (`""` for the unnamed worker).
    pub name: String,
    /// Code.
    pub script: ScriptSource,
    /// Effective compatibility date.
    pub compatibility_date: String,
    /// Effective, sorted compatibility flags.
    pub compatibility_flags: Vec<String>,
    /// Bindings, in declaration order.
    pub bindings: Vec<BindingConfig>,
    /// Where outbound `fetch()` calls go.
    pub global_outbound: ServiceDesignator,
    /// Services receiving trace events.
    pub tails: Vec<ServiceDesignator>,
    /// Zone for the `CF-Worker` header.
    pub cf_worker: String,
}

/// Reference to a service, optionally to one of its entrypoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDesignator {
    /// Service name.
    pub service: String,
    /// Entrypoint export.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
}

impl ServiceDesignator {
    /// Designate a service's default entrypoint.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            entrypoint: None,
        }
    }

    /// Designate a named entrypoint.
    pub fn with_entrypoint(service: impl Into<String>, entrypoint: Option<String>) -> Self {
        Self {
            service: service.into(),
            entrypoint,
        }
    }
}

/// A compiled binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Binding name.
    pub name: String,
    /// Binding value.
    #[serde(flatten)]
    pub kind: CompiledBinding,
}

/// Compiled binding values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompiledBinding {
    /// Fetch/RPC to a service.
    Service(ServiceDesignator),
    /// Value produced by a factory export of an embedded worker.
    Wrapped {
        /// Worker whose code implements the binding.
        implementation: String,
        /// Modules of that worker.
        modules: ScriptSource,
        /// Factory export.
        entrypoint: Option<String>,
        /// Values passed to the factory.
        inner_bindings: BTreeMap<String, serde_json::Value>,
        /// The implementation's own bindings.
        bindings: Vec<BindingConfig>,
        /// Compatibility date inherited from the declaring worker.
        compatibility_date: String,
        /// Compatibility flags inherited from the declaring worker.
        compatibility_flags: Vec<String>,
    },
    /// KV namespace.
    KvNamespace {
        /// Namespace id.
        id: String,
    },
    /// Durable Object namespace.
    DurableObject {
        /// Service defining the class.
        service: String,
        /// Class name.
        class_name: String,
    },
    /// Queue producer.
    QueueProducer {
        /// Queue name.
        queue: String,
    },
    /// R2 bucket.
    R2Bucket {
        /// Bucket name.
        bucket: String,
    },
    /// D1 database.
    D1Database {
        /// Database id.
        id: String,
    },
    /// Plain JSON value.
    Json {
        /// The value.
        value: serde_json::Value,
    },
    /// Text file contents.
    Text {
        /// File path.
        path: String,
    },
    /// Binary file contents.
    Data {
        /// File path.
        path: String,
    },
    /// WebAssembly module.
    WasmModule {
        /// File path.
        path: String,
    },
}

impl CompiledBinding {
    /// Short name of the binding type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Service(_) => "service",
            Self::Wrapped { .. } => "wrapped",
            Self::KvNamespace { .. } => "kv_namespace",
            Self::DurableObject { .. } => "durable_object",
            Self::QueueProducer { .. } => "queue_producer",
            Self::R2Bucket { .. } => "r2_bucket",
            Self::D1Database { .. } => "d1_database",
            Self::Json { .. } => "json",
            Self::Text { .. } => "text",
            Self::Data { .. } => "data",
            Self::WasmModule { .. } => "wasm_module",
        }
    }
}

/// A socket the engine binds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Unique socket name.
    pub name: String,
    /// Host to bind.
    pub host: String,
    /// Port to bind; `0` for OS-assigned.
    pub port: u16,
    /// Service answering on this socket.
    pub service: ServiceDesignator,
}

impl SocketConfig {
    /// `host:port` as requested.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The user worker behind an `entry:` socket.
    pub fn entry_worker(&self) -> Option<&str> {
        self.name.strip_prefix("entry:")
    }
}
