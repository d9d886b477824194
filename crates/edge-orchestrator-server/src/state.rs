//! Shared application state.
//!
//! This module provides [`AppState`], which holds the resources shared by
//! the front door and the loopback server.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use parking_lot::{Mutex, RwLock};

use edge_orchestrator_common::ProxyConfig;
use edge_orchestrator_core::{LoopbackHandler, Router};
use edge_orchestrator_host::{OutboundClient, ProcessSupervisor, RuntimeProcess};

/// Client used to forward requests to engine sockets.
pub type EngineClient = Client<HttpConnector, Body>;

/// Loopback handlers keyed by service name.
pub type HandlerMap = BTreeMap<String, LoopbackHandler>;

/// Shared state across all request handlers.
///
/// Cloning is cheap; clones share everything.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Shared>,
}

struct Shared {
    supervisor: Arc<ProcessSupervisor>,
    proxy: RwLock<ProxyConfig>,
    handlers: RwLock<Arc<HandlerMap>>,
    /// Router of the most recent generation.
    router: Mutex<Option<(u64, Arc<Router>)>>,
    listen_addr: RwLock<Option<SocketAddr>>,
    engine: EngineClient,
    outbound: OutboundClient,
}

impl AppState {
    /// Create new application state.
    pub fn new(supervisor: Arc<ProcessSupervisor>, proxy: ProxyConfig, outbound: OutboundClient) -> Self {
        let engine = Client::builder(TokioExecutor::new()).build_http();
        Self {
            inner: Arc::new(Shared {
                supervisor,
                proxy: RwLock::new(proxy),
                handlers: RwLock::new(Arc::new(BTreeMap::new())),
                router: Mutex::new(None),
                listen_addr: RwLock::new(None),
                engine,
                outbound,
            }),
        }
    }

    /// Get the process supervisor.
    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.inner.supervisor
    }

    /// Snapshot of the header pipeline settings.
    pub fn proxy(&self) -> ProxyConfig {
        self.inner.proxy.read().clone()
    }

    /// Replace the header pipeline settings, returning the previous ones.
    pub fn swap_proxy(&self, proxy: ProxyConfig) -> ProxyConfig {
        std::mem::replace(&mut *self.inner.proxy.write(), proxy)
    }

    /// Snapshot of the loopback handlers.
    pub fn handlers(&self) -> Arc<HandlerMap> {
        Arc::clone(&self.inner.handlers.read())
    }

    /// Replace the loopback handlers.
    pub fn set_handlers(&self, handlers: HandlerMap) {
        *self.inner.handlers.write() = Arc::new(handlers);
    }

    /// Replace the loopback handlers, returning the previous table.
    pub fn swap_handlers(&self, handlers: Arc<HandlerMap>) -> Arc<HandlerMap> {
        std::mem::replace(&mut *self.inner.handlers.write(), handlers)
    }

    /// Address of the front door, once bound.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.inner.listen_addr.read()
    }

    /// Record the front door address.
    pub fn set_listen_addr(&self, addr: SocketAddr) {
        *self.inner.listen_addr.write() = Some(addr);
    }

    /// Router for `process`, built once per generation.
    pub fn router_for(&self, process: &RuntimeProcess) -> Arc<Router> {
        let mut cached = self.inner.router.lock();
        match cached.as_ref() {
            Some((generation, router)) if *generation == process.generation() => Arc::clone(router),
            _ => {
                let router = Arc::new(Router::new(process.config()));
                *cached = Some((process.generation(), Arc::clone(&router)));
                router
            }
        }
    }

    /// Get the engine forwarding client.
    pub fn engine(&self) -> &EngineClient {
        &self.inner.engine
    }

    /// Get the outbound network client.
    pub fn outbound(&self) -> &OutboundClient {
        &self.inner.outbound
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("listen_addr", &self.listen_addr())
            .field("handlers", &self.inner.handlers.read().len())
            .finish_non_exhaustive()
    }
}
