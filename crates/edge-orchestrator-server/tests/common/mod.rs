//! In-process fake engine for front door tests.
//!
//! Entry and direct sockets echo what they received, with a few fixed paths:
//!
//! - `/tagged`: an uncompressed body tagged `Content-Encoding: gzip`
//! - `/redirect`: a relative redirect to `/login`
//! - `/outbound?url=..`: the worker's outbound `fetch(url)`, sent to the
//!   loopback server the way the engine does
//! - `/ws`: accepts a WebSocket upgrade and echoes every byte back
//! - `/ws-declined`: refuses the upgrade with a 400
//!
//! The proxy socket answers binding RPC with an echo of the call.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::{Json, Query, Request};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use serde_json::{Value, json};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use edge_orchestrator_common::{OrchestratorConfig, OrchestratorError, WorkerDefinition};
use edge_orchestrator_core::RuntimeConfig;
use edge_orchestrator_core::runtime_config::{PROXY_SOCKET, loopback_path, outbound_service_name};
use edge_orchestrator_host::{EngineInstance, EngineLauncher, LaunchOptions};
use edge_orchestrator_server::Orchestrator;

/// Body served by `/tagged`.
pub const TAGGED_BODY: &str = "hello from the engine, hello from the engine, hello from the engine";

#[derive(Debug, Default)]
pub struct FakeLauncher {
    pub launches: AtomicUsize,
    pub fail: AtomicBool,
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
                proxy_app()
            } else {
                let worker = socket
                    .entry_worker()
                    .map(str::to_string)
                    .or_else(|| socket.name.split(':').nth(1).map(str::to_string))
                    .unwrap_or_default();
                worker_app(
                    format!("{}#{generation}", socket.name),
                    worker,
                    config.loopback.clone(),
                )
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

fn proxy_app() -> Router {
    Router::new().route(
        "/core/rpc",
        post(|Json(body): Json<Value>| async move {
            Json(json!({
                "value": {
                    "worker": body["worker"],
                    "binding": body["binding"],
                    "path": body["path"],
                    "args": body["args"],
                }
            }))
        }),
    )
}

fn worker_app(origin: String, worker: String, loopback: Option<String>) -> Router {
    Router::new()
        .route(
            "/tagged",
            get(|| async {
                (
                    [("content-type", "text/plain"), ("content-encoding", "gzip")],
                    TAGGED_BODY,
                )
            }),
        )
        .route("/ws", any(accept_upgrade))
        .route(
            "/ws-declined",
            any(|| async { (StatusCode::BAD_REQUEST, "no upgrade here") }),
        )
        .route(
            "/redirect",
            get(|| async { (StatusCode::FOUND, [("location", "/login")]) }),
        )
        .route(
            "/outbound",
            any(move |Query(query): Query<HashMap<String, String>>, headers: HeaderMap| {
                let worker = worker.clone();
                let loopback = loopback.clone();
                async move { outbound(&worker, loopback.as_deref(), &query, &headers).await }
            }),
        )
        .fallback(move |request: Request| {
            let origin = origin.clone();
            async move { echo(&origin, &request) }
        })
}

/// Switch protocols and echo the upgraded stream.
async fn accept_upgrade(mut request: Request) -> Response {
    let upgrade = hyper::upgrade::on(&mut request);
    tokio::spawn(async move {
        if let Ok(upgraded) = upgrade.await {
            let (mut reader, mut writer) = tokio::io::split(TokioIo::new(upgraded));
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header("connection", "upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-protocol", "echo")
        .header("set-cookie", "session=1")
        .body(Body::empty())
        .unwrap()
}

/// Send the worker's outbound request to the loopback server.
async fn outbound(
    worker: &str,
    loopback: Option<&str>,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Response {
    let (Some(loopback), Some(url)) = (loopback, query.get("url")) else {
        return (StatusCode::BAD_REQUEST, "missing loopback or url").into_response();
    };

    let mut request = reqwest::Client::new()
        .get(format!("http://{loopback}{}", loopback_path(&outbound_service_name(worker))))
        .header("MF-Original-URL", url)
        .header("MF-Custom-Service", "leaked");
    for (name, value) in headers {
        if name.as_str().starts_with("x-") || name == "cf-connecting-ip" {
            request = request.header(name.as_str(), value.as_bytes());
        }
    }

    match request.send().await {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let body = response.text().await.unwrap_or_default();
            (status, body).into_response()
        }
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

/// Responds with a JSON summary of the request.
fn echo(origin: &str, request: &Request) -> Response {
    Json(json!({
        "origin": origin,
        "method": request.method().as_str(),
        "uri": request.uri().to_string(),
        "headers": header_map(request.headers()),
    }))
    .into_response()
}

pub fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

/// Configuration listening on a fresh port.
pub fn config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.server.port = 0;
    config
}

/// Start an orchestrator on the fake engine and wait until it is ready.
pub async fn start(
    config: OrchestratorConfig,
    workers: Vec<WorkerDefinition>,
) -> (Arc<FakeLauncher>, Orchestrator, url::Url) {
    let launcher = FakeLauncher::new();
    let orchestrator = Orchestrator::with_launcher(config, workers, launcher.clone())
        .await
        .unwrap();
    let url = orchestrator.ready().await.unwrap();
    (launcher, orchestrator, url)
}

/// A client that doesn't follow redirects.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// GET `path` and decode the echoed JSON.
pub async fn get_json(url: &url::Url, path: &str) -> Value {
    client()
        .get(url.join(path).unwrap())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}
