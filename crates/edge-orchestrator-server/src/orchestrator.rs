//! The public orchestrator API.
//!
//! An [`Orchestrator`] owns one supervisor, the front door and the loopback
//! server. Several orchestrators can run side by side in one process; they
//! share nothing.
//!
//! # Example
//!
//! ```ignore
//! use edge_orchestrator_common::{OrchestratorConfig, WorkerDefinition};
//! use edge_orchestrator_server::Orchestrator;
//!
//! let workers = vec![WorkerDefinition::module("api", "export default { fetch() {} }")];
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default(), workers).await?;
//!
//! let url = orchestrator.ready().await?;
//! println!("Serving on {url}");
//!
//! orchestrator.dispose().await;
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::HOST;
use axum::http::{HeaderValue, Uri};
use http_body_util::BodyExt;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use tracing::{debug, error, info, instrument};
use url::Url;

use edge_orchestrator_common::{
    HandlerRequest, HandlerResponse, OrchestratorConfig, OrchestratorError, WorkerDefinition,
};
use edge_orchestrator_core::{CompileOptions, Compilation, ConfigCompiler};
use edge_orchestrator_host::{
    BindingProxyRegistry, BindingStub, EngineLauncher, OutboundClient, ProcessLauncher,
    ProcessSupervisor, SupervisorOptions, WorkerStub,
};

use crate::loopback::build_loopback_router;
use crate::router::build_router;
use crate::server::{ServerHandle, connectable};
use crate::state::AppState;

/// Peer address attached to requests sent through [`Orchestrator::dispatch_fetch`].
const DISPATCH_PEER: ([u8; 4], u16) = ([127, 0, 0, 1], 0);

/// Listeners and the configuration they were started with.
struct Listeners {
    config: OrchestratorConfig,
    front: Option<ServerHandle>,
    loopback: Option<ServerHandle>,
}

/// Local orchestrator for a set of workers.
pub struct Orchestrator {
    state: AppState,
    app: RwLock<axum::Router>,
    rpc: reqwest::Client,
    /// Held by whoever is reconfiguring.
    listeners: Arc<Mutex<Listeners>>,
}

impl Orchestrator {
    /// Start an orchestrator running the engine binary from `config`.
    ///
    /// Returns once the listeners are bound; the engine starts in the
    /// background. Await [`ready`](Self::ready) before sending requests.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `workers` don't compile, or
    /// `StartupFailure` if a listener can't be bound.
    pub async fn new(
        config: OrchestratorConfig,
        workers: Vec<WorkerDefinition>,
    ) -> Result<Self, OrchestratorError> {
        let launcher = Arc::new(ProcessLauncher::from_config(&config.engine));
        Self::with_launcher(config, workers, launcher).await
    }

    /// Start an orchestrator with a custom engine launcher.
    pub async fn with_launcher(
        config: OrchestratorConfig,
        workers: Vec<WorkerDefinition>,
        launcher: Arc<dyn EngineLauncher>,
    ) -> Result<Self, OrchestratorError> {
        let supervisor = Arc::new(ProcessSupervisor::new(
            launcher,
            SupervisorOptions::from_config(&config.engine),
        ));
        let outbound = OutboundClient::new(config.server.request_timeout())
            .map_err(|err| OrchestratorError::startup(err.to_string()))?;
        let state = AppState::new(Arc::clone(&supervisor), config.proxy.clone(), outbound);

        let loopback =
            ServerHandle::bind(&config.server.host, 0, build_loopback_router(state.clone())).await?;
        let compilation = match compile(&config, loopback.addr(), &workers) {
            Ok(compilation) => compilation,
            Err(err) => {
                loopback.shutdown().await;
                return Err(err);
            }
        };
        state.set_handlers(compilation.handlers);

        let app = build_router(state.clone(), config.server.request_timeout());
        let front = match ServerHandle::bind(&config.server.host, config.server.port, app.clone()).await {
            Ok(front) => front,
            Err(err) => {
                loopback.shutdown().await;
                return Err(err);
            }
        };
        state.set_listen_addr(front.addr());

        let listeners = Arc::new(Mutex::new(Listeners {
            config,
            front: Some(front),
            loopback: Some(loopback),
        }));

        // ready() and set_options() wait for this first start
        let guard = Arc::clone(&listeners).lock_owned().await;
        let runtime = compilation.config;
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = supervisor.apply(runtime).await {
                error!(error = %err, "Failed to start engine");
            }
        });

        Ok(Self {
            state,
            app: RwLock::new(app),
            rpc: reqwest::Client::new(),
            listeners,
        })
    }

    /// Wait until the engine serves the current configuration.
    ///
    /// Resolves to the front door URL.
    ///
    /// # Errors
    ///
    /// Returns the startup failure of the most recent start, or `Disposed`.
    pub async fn ready(&self) -> Result<Url, OrchestratorError> {
        {
            let _listeners = self.listeners.lock().await;
        }
        self.state.supervisor().ready().await?;
        self.url()
    }

    fn url(&self) -> Result<Url, OrchestratorError> {
        let addr = self.state.listen_addr().ok_or(OrchestratorError::Disposed)?;
        Url::parse(&format!("http://{}/", connectable(addr)))
            .map_err(|err| OrchestratorError::transport(err.to_string()))
    }

    /// Send a request through the front door without a network hop.
    ///
    /// The request URI must be absolute; its authority becomes the `Host`
    /// unless the request sets one. Pipeline failures come back as error
    /// responses, not as `Err`.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` after [`dispose`](Self::dispose), or a startup
    /// failure if the engine isn't running.
    #[instrument(skip_all, fields(uri = %request.uri()))]
    pub async fn dispatch_fetch(&self, request: HandlerRequest) -> Result<HandlerResponse, OrchestratorError> {
        self.ready().await?;

        let (mut parts, body) = request.into_parts();
        if !parts.headers.contains_key(HOST) {
            if let Some(authority) = parts.uri.authority() {
                if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                    parts.headers.insert(HOST, value);
                }
            }
        }
        let path = parts
            .uri
            .path_and_query()
            .map_or("/", |path| path.as_str())
            .to_string();
        parts.uri = path
            .parse::<Uri>()
            .map_err(|err| OrchestratorError::transport(format!("invalid request path: {err}")))?;

        let mut request = axum::http::Request::from_parts(parts, Body::from(body));
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(DISPATCH_PEER)));

        let app = self.app.read().clone();
        let response = match app.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|err| OrchestratorError::transport(err.to_string()))?
            .to_bytes();
        Ok(HandlerResponse::from_parts(parts, body))
    }

    async fn registry(&self) -> Result<BindingProxyRegistry, OrchestratorError> {
        self.ready().await?;
        let process = self.state.supervisor().current()?;
        Ok(BindingProxyRegistry::new(process, self.rpc.clone()))
    }

    /// A handle to a worker; `None` means the entrypoint worker.
    pub async fn get_worker(&self, name: Option<&str>) -> Result<WorkerStub, OrchestratorError> {
        self.registry().await?.get_worker(name)
    }

    /// Every binding of a worker; `None` means the entrypoint worker and
    /// `Some("")` the unnamed one.
    pub async fn get_bindings(
        &self,
        name: Option<&str>,
    ) -> Result<BTreeMap<String, BindingStub>, OrchestratorError> {
        self.registry().await?.get_bindings(name)
    }

    /// One binding of a worker.
    pub async fn get_binding(&self, worker: Option<&str>, binding: &str) -> Result<BindingStub, OrchestratorError> {
        self.registry().await?.get_binding(worker, binding)
    }

    /// A KV namespace binding.
    pub async fn get_kv_namespace(&self, binding: &str, worker: Option<&str>) -> Result<BindingStub, OrchestratorError> {
        self.registry().await?.get_kv_namespace(binding, worker)
    }

    /// An R2 bucket binding.
    pub async fn get_r2_bucket(&self, binding: &str, worker: Option<&str>) -> Result<BindingStub, OrchestratorError> {
        self.registry().await?.get_r2_bucket(binding, worker)
    }

    /// A D1 database binding.
    pub async fn get_d1_database(&self, binding: &str, worker: Option<&str>) -> Result<BindingStub, OrchestratorError> {
        self.registry().await?.get_d1_database(binding, worker)
    }

    /// A queue producer binding.
    pub async fn get_queue_producer(&self, binding: &str, worker: Option<&str>) -> Result<BindingStub, OrchestratorError> {
        self.registry().await?.get_queue_producer(binding, worker)
    }

    /// A Durable Object namespace binding.
    pub async fn get_durable_object_namespace(
        &self,
        binding: &str,
        worker: Option<&str>,
    ) -> Result<BindingStub, OrchestratorError> {
        self.registry().await?.get_durable_object_namespace(binding, worker)
    }

    /// The `cf` object requests are made with.
    pub async fn get_cf(&self) -> Result<Value, OrchestratorError> {
        self.ready().await?;
        Ok(self.state.proxy().cf.unwrap_or_else(fallback_cf))
    }

    /// URL of a worker's direct socket; `None` entrypoint means the default
    /// export.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the worker didn't declare that direct socket.
    pub async fn unsafe_get_direct_url(
        &self,
        worker: Option<&str>,
        entrypoint: Option<&str>,
    ) -> Result<Url, OrchestratorError> {
        self.ready().await?;
        let process = self.state.supervisor().current()?;
        let socket = self.state.router_for(&process).direct_route(worker, entrypoint)?;
        let addr = process
            .socket(&socket)
            .ok_or_else(|| OrchestratorError::not_found("socket", &socket, "the running engine process"))?;
        Url::parse(&format!("http://{}/", connectable(addr)))
            .map_err(|err| OrchestratorError::transport(err.to_string()))
    }

    /// Reconfigure.
    ///
    /// The engine is restarted only if the compiled configuration changed.
    /// Loopback handlers are swapped in place. The front door is rebound
    /// when its host, port or timeout changes, or when it listens on port `0`
    /// and the engine restarted. Engine settings are fixed at construction.
    ///
    /// # Errors
    ///
    /// On a configuration error nothing is applied. A startup failure
    /// restores the previous proxy settings, handlers and loopback server
    /// but leaves the orchestrator without a running engine until the next
    /// successful call.
    #[instrument(skip_all, fields(workers = workers.len()))]
    pub async fn set_options(
        &self,
        config: OrchestratorConfig,
        workers: Vec<WorkerDefinition>,
    ) -> Result<(), OrchestratorError> {
        let mut listeners = self.listeners.lock().await;
        if self.state.supervisor().is_disposed() {
            return Err(OrchestratorError::Disposed);
        }

        let host_changed = config.server.host != listeners.config.server.host;
        let new_loopback = if host_changed {
            Some(ServerHandle::bind(&config.server.host, 0, build_loopback_router(self.state.clone())).await?)
        } else {
            None
        };
        let loopback_addr = match (&new_loopback, &listeners.loopback) {
            (Some(handle), _) | (None, Some(handle)) => handle.addr(),
            (None, None) => return Err(OrchestratorError::Disposed),
        };

        let compilation = match compile(&config, loopback_addr, &workers) {
            Ok(compilation) => compilation,
            Err(err) => {
                if let Some(handle) = new_loopback {
                    handle.shutdown().await;
                }
                return Err(err);
            }
        };

        // The new generation needs its handlers from its first request on
        let previous_proxy = self.state.swap_proxy(config.proxy.clone());
        let previous_handlers = self.state.swap_handlers(Arc::new(compilation.handlers));

        let applied = match self.state.supervisor().apply(compilation.config).await {
            Ok(applied) => applied,
            Err(err) => {
                self.state.swap_proxy(previous_proxy);
                self.state.swap_handlers(previous_handlers);
                if let Some(handle) = new_loopback {
                    handle.shutdown().await;
                }
                return Err(err);
            }
        };

        if let Some(handle) = new_loopback {
            if let Some(old) = listeners.loopback.replace(handle) {
                old.shutdown().await;
            }
        }

        let rebind = host_changed
            || config.server.port != listeners.config.server.port
            || config.server.request_timeout_secs != listeners.config.server.request_timeout_secs
            || (applied.restarted && config.server.port == 0);
        if rebind {
            // Rebinding the same explicit address needs the old listener gone
            let same_addr = !host_changed
                && config.server.port != 0
                && config.server.port == listeners.config.server.port;
            if same_addr {
                if let Some(old) = listeners.front.take() {
                    old.shutdown().await;
                }
            }

            let app = build_router(self.state.clone(), config.server.request_timeout());
            let front = ServerHandle::bind(&config.server.host, config.server.port, app.clone()).await?;
            let addr = front.addr();
            self.state.set_listen_addr(addr);
            *self.app.write() = app;
            if let Some(old) = listeners.front.replace(front) {
                old.shutdown().await;
            }
            info!(%addr, "Front door rebound");
        } else {
            debug!(restarted = applied.restarted, "Front door kept");
        }

        listeners.config = config;
        Ok(())
    }

    /// Shared state of the front door and loopback server.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Address of the loopback server, while it runs.
    pub async fn loopback_addr(&self) -> Option<SocketAddr> {
        self.listeners
            .lock()
            .await
            .loopback
            .as_ref()
            .map(ServerHandle::addr)
    }

    /// Stop the engine and both listeners.
    ///
    /// Idempotent. Pending and later calls fail with `Disposed`.
    pub async fn dispose(&self) {
        self.state.supervisor().dispose().await;

        let mut listeners = self.listeners.lock().await;
        let front = listeners.front.take();
        let loopback = listeners.loopback.take();
        drop(listeners);

        if let Some(front) = front {
            front.shutdown().await;
        }
        if let Some(loopback) = loopback {
            loopback.shutdown().await;
        }
        info!("Orchestrator disposed");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn compile(
    config: &OrchestratorConfig,
    loopback: SocketAddr,
    workers: &[WorkerDefinition],
) -> Result<Compilation, OrchestratorError> {
    ConfigCompiler::new(CompileOptions {
        loopback: Some(connectable(loopback).to_string()),
        upstream: config.proxy.upstream.clone(),
    })
    .compile_all(workers)
}

/// The `cf` object used when none is configured.
fn fallback_cf() -> Value {
    json!({
        "asn": 395_747,
        "colo": "DFW",
        "city": "Austin",
        "region": "Texas",
        "regionCode": "TX",
        "metroCode": "635",
        "postalCode": "78701",
        "country": "US",
        "continent": "NA",
        "timezone": "America/Chicago",
        "latitude": "30.27130",
        "longitude": "-97.74260",
        "clientTcpRtt": 0,
        "httpProtocol": "HTTP/1.1",
        "requestPriority": "weight=192;exclusive=0",
        "tlsCipher": "AEAD-AES128-GCM-SHA256",
        "tlsVersion": "TLSv1.3",
        "tlsClientAuth": {
            "certPresented": "0",
            "certVerified": "NONE",
            "certRevoked": "0",
        },
    })
}
