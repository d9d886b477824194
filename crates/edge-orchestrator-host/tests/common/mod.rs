//! In-process fake engine.
//!
//! Binds every configured socket with a real Tokio listener. The proxy socket
//! answers binding RPC; every other socket echoes the request it received.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Json, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use edge_orchestrator_common::{OrchestratorError, WorkerDefinition};
use edge_orchestrator_core::runtime_config::PROXY_SOCKET;
use edge_orchestrator_core::{ConfigCompiler, RuntimeConfig};
use edge_orchestrator_host::{EngineInstance, EngineLauncher, LaunchOptions};

#[derive(Debug, Default)]
pub struct FakeLauncher {
    pub launches: AtomicUsize,
    pub fail: AtomicBool,
    /// Milliseconds each launch takes.
    pub delay_ms: AtomicU64,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    async fn launch(
        &self,
        config: &RuntimeConfig,
        _options: &LaunchOptions,
    ) -> Result<Box<dyn EngineInstance>, OrchestratorError> {
        let generation = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(OrchestratorError::startup("fake engine refused to start"));
        }

        let mut sockets = BTreeMap::new();
        let mut tasks = Vec::new();
        for socket in &config.sockets {
            let listener = TcpListener::bind(socket.address())
                .await
                .map_err(|err| OrchestratorError::startup_io(format!("bind {}", socket.name), err))?;
            let addr = listener
                .local_addr()
                .map_err(|err| OrchestratorError::startup_io("local_addr", err))?;

            let app = if socket.name == PROXY_SOCKET {
                proxy_app(generation)
            } else {
                echo_app(socket.name.clone(), generation)
            };
            tasks.push(tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            }));
            sockets.insert(socket.name.clone(), addr);
        }

        Ok(Box::new(FakeInstance { sockets, tasks }))
    }
}

struct FakeInstance {
    sockets: BTreeMap<String, SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl EngineInstance for FakeInstance {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn sockets(&self) -> &BTreeMap<String, SocketAddr> {
        &self.sockets
    }

    fn inspector(&self) -> Option<SocketAddr> {
        None
    }

    async fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

fn proxy_app(generation: usize) -> Router {
    Router::new()
        .route(
            "/core/rpc",
            post(move |Json(body): Json<Value>| async move { rpc(generation, &body) }),
        )
        .route(
            "/core/call",
            post(move |Json(body): Json<Value>| async move {
                Json(json!({"value": {"called": body["target"], "args": body["args"]}}))
                    .into_response()
            }),
        )
        .fallback(move |request: Request| async move { echo(&format!("proxy#{generation}"), request) })
}

fn rpc(generation: usize, body: &Value) -> Response {
    let method = body["path"][0].as_str().unwrap_or_default();
    match method {
        "explode" => (StatusCode::INTERNAL_SERVER_ERROR, "Error: kaboom inside the engine").into_response(),
        "counter" => Json(json!({
            "object": {
                "count": {"value": 1},
                "increment": {"callable": {"id": "counter.increment"}}
            }
        }))
        .into_response(),
        _ => Json(json!({
            "value": {
                "generation": generation,
                "worker": body["worker"],
                "binding": body["binding"],
                "entrypoint": body["entrypoint"],
                "path": body["path"],
                "args": body["args"],
            }
        }))
        .into_response(),
    }
}

fn echo_app(socket: String, generation: usize) -> Router {
    Router::new().fallback(move |request: Request| {
        let socket = socket.clone();
        async move { echo(&format!("{socket}#{generation}"), request) }
    })
}

/// Responds with a JSON summary of the request.
fn echo(origin: &str, request: Request) -> Response {
    let headers: BTreeMap<String, String> = request
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    Json(json!({
        "origin": origin,
        "method": request.method().as_str(),
        "uri": request.uri().to_string(),
        "headers": headers,
    }))
    .into_response()
}

/// Compile definitions with default options.
pub fn compile(defs: &[WorkerDefinition]) -> RuntimeConfig {
    ConfigCompiler::default().compile(defs).unwrap()
}

/// A free local port.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
