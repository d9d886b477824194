//! Front door request handler.
//!
//! Every request goes through the header pipeline, is routed to a worker and
//! forwarded to that worker's entry socket on the current engine process.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{ACCEPT_ENCODING, HOST, UPGRADE};
use axum::http::{HeaderValue, Uri, Version};
use axum::response::Response;
use bytes::Bytes;
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

use edge_orchestrator_common::OrchestratorError;
use edge_orchestrator_core::router::host_with_port;
use edge_orchestrator_host::{InflightGuard, RuntimeProcess};

use crate::encoding::encode_response;
use crate::pipeline::{
    ORIGINAL_HOSTNAME, check_shared_secret, rewrite_location, scrub_internal_headers,
    set_client_ip,
};
use crate::response::{error_response, text_response};
use crate::state::AppState;
use crate::websocket;

/// Prefix of the paths triggering non-HTTP events.
const HANDLER_PATH_PREFIX: &str = "/cdn-cgi/handler/";

/// Event handlers that can be triggered over HTTP.
const TRIGGERABLE_HANDLERS: &[&str] = &["scheduled", "email"];

/// How often a request is re-routed when its process stops under it.
const ROUTE_ATTEMPTS: usize = 3;

/// Handle a request arriving at the front door.
#[instrument(
    skip_all,
    fields(request_id = %Uuid::new_v4(), method = %request.method(), path = %request.uri().path())
)]
pub async fn handle_request(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    match forward(&state, peer, request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, status = err.status_code(), "Request failed");
            error_response(&err)
        }
    }
}

async fn forward(
    state: &AppState,
    peer: SocketAddr,
    mut request: Request,
) -> Result<Response, OrchestratorError> {
    let proxy = state.proxy();
    let trusted = check_shared_secret(request.headers(), proxy.unsafe_proxy_shared_secret.as_deref())?;

    let headers = request.headers_mut();
    scrub_internal_headers(headers);
    set_client_ip(headers, peer.ip());
    let accept_encoding = headers
        .get(ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let original = original_url(&request, state.listen_addr())?;
    if let Some(response) = check_handler_path(original.path()) {
        return Ok(response);
    }

    let (process, guard) = begin(state).await?;
    let target = state.router_for(&process).route(&original);
    let entry = process.entry_addr(&target.worker).ok_or_else(|| {
        OrchestratorError::not_found("entry socket", &target.worker, "the running engine process")
    })?;
    debug!(
        worker = %target.worker,
        generation = process.generation(),
        %entry,
        "Forwarding request"
    );

    let headers = request.headers_mut();
    match &target.original_hostname {
        Some(hostname) => {
            set_header(headers, HOST, &host_with_port(&target.url));
            set_header(headers, ORIGINAL_HOSTNAME, hostname);
        }
        None if trusted => {}
        None => {
            if let Some(addr) = state.listen_addr() {
                set_header(headers, HOST, &addr.to_string());
            }
        }
    }
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    let path = target
        .url
        .query()
        .map_or_else(|| target.url.path().to_string(), |query| format!("{}?{query}", target.url.path()));

    if request.headers().contains_key(UPGRADE) {
        return websocket::relay(request, entry, &path, guard).await;
    }

    *request.uri_mut() = format!("http://{entry}{path}")
        .parse::<Uri>()
        .map_err(|err| OrchestratorError::transport(format!("invalid forwarding URI: {err}")))?;
    *request.version_mut() = Version::HTTP_11;

    let response = state
        .engine()
        .request(request)
        .await
        .map_err(|err| OrchestratorError::transport(format!("engine request failed: {err}")))?;

    let mut response = response.map(|body| GuardedBody::wrap(Body::new(body), guard));
    rewrite_location(response.headers_mut(), &original);
    Ok(encode_response(response, accept_encoding.as_deref()))
}

/// Wait for a ready process and register the request against it.
async fn begin(state: &AppState) -> Result<(Arc<RuntimeProcess>, InflightGuard), OrchestratorError> {
    for _ in 0..ROUTE_ATTEMPTS {
        let process = state.supervisor().ready().await?;
        if let Some(guard) = process.try_begin_request() {
            return Ok((process, guard));
        }
        debug!(generation = process.generation(), "Process stopped before the request began");
        tokio::task::yield_now().await;
    }
    Err(OrchestratorError::startup("Engine process is not running"))
}

/// The URL the client asked for.
fn original_url(request: &Request, listen_addr: Option<SocketAddr>) -> Result<Url, OrchestratorError> {
    let path = request
        .uri()
        .path_and_query()
        .map_or("/", |path| path.as_str());
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| listen_addr.map(|addr| addr.to_string()))
        .unwrap_or_else(|| "localhost".to_string());

    // A malformed Host falls back to localhost
    Url::parse(&format!("http://{host}{path}"))
        .or_else(|_| Url::parse(&format!("http://localhost{path}")))
        .map_err(|err| OrchestratorError::transport(format!("invalid request URL: {err}")))
}

/// 404 for `/cdn-cgi/handler/*` paths naming an unknown event handler.
fn check_handler_path(path: &str) -> Option<Response> {
    let name = path.strip_prefix(HANDLER_PATH_PREFIX)?;
    let name = name.split('/').next().unwrap_or_default();
    if TRIGGERABLE_HANDLERS.contains(&name) {
        return None;
    }
    Some(text_response(
        404,
        format!("\"{name}\" is not a valid handler. Did you mean to use \"scheduled\" or \"email\"?"),
    ))
}

fn set_header(headers: &mut axum::http::HeaderMap, name: impl axum::http::header::IntoHeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// A response body holding its process generation alive until dropped.
pub struct GuardedBody {
    inner: Body,
    _guard: InflightGuard,
}

impl GuardedBody {
    /// Wrap `inner` into an axum body holding `guard`.
    pub fn wrap(inner: Body, guard: InflightGuard) -> Body {
        Body::new(Self {
            inner,
            _guard: guard,
        })
    }
}

impl HttpBody for GuardedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
