//! Worker definitions.
//!
//! A [`WorkerDefinition`] is the user-facing description of one worker:
//! its code, bindings, routes, and compatibility settings. The first entry in
//! a definition list is the *entrypoint* worker.
//!
//! Definitions are plain data and deserialize from TOML/JSON, except for
//! inline Rust handlers ([`InlineHandler`]), which can only be supplied
//! programmatically.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A request handled by a Rust-side handler.
pub type HandlerRequest = hyper::Request<Bytes>;

/// A response produced by a Rust-side handler.
pub type HandlerResponse = hyper::Response<Bytes>;

/// A Rust-side HTTP handler reachable from worker code.
///
/// Used for inline outbound services and `node_custom` bindings. The engine
/// reaches these handlers through the loopback server.
#[async_trait]
pub trait FetchHandler: Send + Sync {
    /// Handle a single request.
    async fn fetch(&self, request: HandlerRequest) -> HandlerResponse;
}

/// Shared, cloneable wrapper around a [`FetchHandler`].
#[derive(Clone)]
pub struct InlineHandler(pub Arc<dyn FetchHandler>);

impl InlineHandler {
    /// Wrap a handler.
    pub fn new(handler: impl FetchHandler + 'static) -> Self {
        Self(Arc::new(handler))
    }
}

impl fmt::Debug for InlineHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InlineHandler(..)")
    }
}

/// A single worker's definition.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkerDefinition {
    /// Worker name. `None` and `Some("")` both denote the unnamed worker.
    #[serde(default)]
    pub name: Option<String>,

    /// The worker's code.
    pub script: ScriptSource,

    /// Route patterns (`[scheme://]host[/path]` with `*` wildcards).
    #[serde(default)]
    pub routes: Vec<String>,

    /// Bindings exposed to the worker.
    #[serde(default)]
    pub bindings: Vec<BindingSpec>,

    /// Compatibility date (`YYYY-MM-DD`).
    #[serde(default)]
    pub compatibility_date: Option<String>,

    /// Explicit compatibility flags.
    #[serde(default)]
    pub compatibility_flags: Vec<String>,

    /// Where the worker's outbound `fetch()` calls go.
    #[serde(default)]
    pub outbound_service: Option<OutboundService>,

    /// Declarative mock answering the worker's outbound `fetch()` calls.
    #[serde(default)]
    pub fetch_mock: Option<FetchMock>,

    /// Workers receiving this worker's trace events.
    #[serde(default)]
    pub tails: Vec<WorkerRef>,

    /// Sockets exposing this worker directly, bypassing routing.
    #[serde(default)]
    pub unsafe_direct_sockets: Vec<DirectSocket>,

    /// Upstream base URL; overrides the shared `proxy.upstream`.
    #[serde(default)]
    pub upstream: Option<String>,

    /// Zone used for the `CF-Worker` header on outbound requests.
    #[serde(default)]
    pub zone: Option<String>,
}

impl WorkerDefinition {
    /// Create a modules-format worker with a single ES module.
    pub fn module(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            script: ScriptSource::Modules {
                modules: vec![WorkerModule {
                    name: "index.mjs".into(),
                    kind: ModuleKind::Esm,
                    contents: Some(code.into()),
                    path: None,
                }],
            },
            ..Default::default()
        }
    }

    /// Create a service-worker format worker.
    pub fn service_worker(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            script: ScriptSource::Script {
                code: Some(code.into()),
                path: None,
            },
            ..Default::default()
        }
    }

    /// The normalized name; the unnamed worker is `""`.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Returns `true` if the worker uses modules format.
    pub fn is_modules(&self) -> bool {
        matches!(self.script, ScriptSource::Modules { .. })
    }

    /// Returns `true` if the worker declares any compatibility settings or
    /// an outbound service of its own.
    pub fn has_own_settings(&self) -> bool {
        self.compatibility_date.is_some()
            || !self.compatibility_flags.is_empty()
            || self.outbound_service.is_some()
            || self.fetch_mock.is_some()
    }

    /// Add a binding (builder style).
    #[must_use]
    pub fn with_binding(mut self, name: impl Into<String>, kind: BindingKind) -> Self {
        self.bindings.push(BindingSpec {
            name: name.into(),
            kind,
        });
        self
    }

    /// Add a route (builder style).
    #[must_use]
    pub fn with_route(mut self, pattern: impl Into<String>) -> Self {
        self.routes.push(pattern.into());
        self
    }

    /// Set the compatibility date (builder style).
    #[must_use]
    pub fn with_compatibility_date(mut self, date: impl Into<String>) -> Self {
        self.compatibility_date = Some(date.into());
        self
    }
}

/// The worker's code, either a single service-worker script or modules.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ScriptSource {
    /// Service-worker format script.
    Script {
        /// Inline source code.
        #[serde(default)]
        code: Option<String>,
        /// Path to the source file.
        #[serde(default)]
        path: Option<String>,
    },
    /// ES modules / CommonJS / data modules.
    Modules {
        /// Modules; the first one is the main module.
        modules: Vec<WorkerModule>,
    },
}

impl Default for ScriptSource {
    fn default() -> Self {
        Self::Script {
            code: None,
            path: None,
        }
    }
}

/// A single module of a modules-format worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerModule {
    /// Module specifier.
    pub name: String,
    /// Module type.
    #[serde(rename = "type", default)]
    pub kind: ModuleKind,
    /// Inline contents.
    #[serde(default)]
    pub contents: Option<String>,
    /// Path to the module file.
    #[serde(default)]
    pub path: Option<String>,
}

/// Module types understood by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    #[default]
    Esm,
    Commonjs,
    Text,
    Data,
    Wasm,
    Python,
}

/// Reference to another worker, optionally to a named entrypoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerRef {
    /// Target worker name.
    pub name: String,
    /// Named entrypoint export; the default export when absent.
    #[serde(default)]
    pub entrypoint: Option<String>,
}

impl WorkerRef {
    /// Reference a worker's default entrypoint.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entrypoint: None,
        }
    }

    /// Reference a named entrypoint.
    #[must_use]
    pub fn entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }
}

/// Destination for a worker's outbound requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundService {
    /// Another worker.
    Worker(WorkerRef),
    /// A Rust handler served by the loopback server.
    #[serde(skip)]
    Inline(InlineHandler),
}

/// A declarative mock for outbound requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FetchMock {
    /// Interceptors, matched in order.
    #[serde(default)]
    pub interceptors: Vec<MockInterceptor>,
}

/// One mocked request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MockInterceptor {
    /// Origin, e.g. `https://example.com`.
    pub origin: String,
    /// Exact path (including query) to match.
    pub path: String,
    /// Method to match; any method when absent.
    #[serde(default)]
    pub method: Option<String>,
    /// Response status.
    #[serde(default = "default_mock_status")]
    pub status: u16,
    /// Response body.
    #[serde(default)]
    pub body: String,
    /// Response headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_mock_status() -> u16 {
    200
}

/// A socket exposing a worker entrypoint directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DirectSocket {
    /// Host to bind; `127.0.0.1` when absent.
    #[serde(default)]
    pub host: Option<String>,
    /// Port to bind; OS-assigned when absent or `0`.
    #[serde(default)]
    pub port: Option<u16>,
    /// Entrypoint export; the default export when absent.
    #[serde(default)]
    pub entrypoint: Option<String>,
}

/// A named binding.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BindingSpec {
    /// Name under which the binding appears in the worker's `env`.
    pub name: String,
    /// What the binding is.
    #[serde(flatten)]
    pub kind: BindingKind,
}

/// The kinds of binding a worker can declare.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BindingKind {
    /// Service binding to another worker.
    Service {
        /// Target worker.
        target: String,
        /// Named entrypoint of the target.
        #[serde(default)]
        entrypoint: Option<String>,
    },
    /// Value produced by another worker's exported factory.
    Wrapped {
        /// Worker implementing the binding.
        script_name: String,
        /// Export to call; the default export when absent.
        #[serde(default)]
        entrypoint: Option<String>,
        /// Values passed to the factory.
        #[serde(default)]
        inner_bindings: BTreeMap<String, serde_json::Value>,
    },
    /// Access to the public internet, restricted to some hosts.
    Network {
        /// Host patterns (`api.example.com`, `*.example.com`, `*`).
        #[serde(default)]
        allowed_hosts: Vec<String>,
    },
    /// An external HTTP server.
    External {
        /// `host:port` of the server.
        address: String,
        /// `http` or `https`.
        #[serde(default = "default_scheme")]
        scheme: String,
    },
    /// A directory served over HTTP.
    Disk {
        /// Directory path.
        path: String,
        /// Whether `PUT` is allowed.
        #[serde(default)]
        writable: bool,
    },
    /// A Rust handler served by the loopback server.
    NodeCustom {
        /// The handler.
        #[serde(skip)]
        handler: Option<InlineHandler>,
    },
    /// KV namespace.
    KvNamespace {
        /// Namespace id; the binding name when absent.
        #[serde(default)]
        id: Option<String>,
    },
    /// Durable Object namespace.
    DurableObject {
        /// Worker defining the class; the declaring worker when absent.
        #[serde(default)]
        script_name: Option<String>,
        /// Exported class name.
        class_name: String,
    },
    /// Queue producer.
    QueueProducer {
        /// Queue name; the binding name when absent.
        #[serde(default)]
        queue: Option<String>,
    },
    /// R2 bucket.
    R2Bucket {
        /// Bucket name; the binding name when absent.
        #[serde(default)]
        bucket: Option<String>,
    },
    /// D1 database.
    D1Database {
        /// Database id; the binding name when absent.
        #[serde(default)]
        id: Option<String>,
    },
    /// A plain JSON value.
    PlainValue {
        /// The value.
        value: serde_json::Value,
    },
    /// Text read from a file.
    TextBlob {
        /// File path.
        path: String,
    },
    /// Bytes read from a file.
    DataBlob {
        /// File path.
        path: String,
    },
    /// A WebAssembly module read from a file.
    WasmModule {
        /// File path.
        path: String,
    },
}

fn default_scheme() -> String {
    "http".to_string()
}

impl BindingKind {
    /// Short name of the kind, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Service { .. } => "service",
            Self::Wrapped { .. } => "wrapped",
            Self::Network { .. } => "network",
            Self::External { .. } => "external",
            Self::Disk { .. } => "disk",
            Self::NodeCustom { .. } => "node_custom",
            Self::KvNamespace { .. } => "kv_namespace",
            Self::DurableObject { .. } => "durable_object",
            Self::QueueProducer { .. } => "queue_producer",
            Self::R2Bucket { .. } => "r2_bucket",
            Self::D1Database { .. } => "d1_database",
            Self::PlainValue { .. } => "plain_value",
            Self::TextBlob { .. } => "text_blob",
            Self::DataBlob { .. } => "data_blob",
            Self::WasmModule { .. } => "wasm_module",
        }
    }
}
