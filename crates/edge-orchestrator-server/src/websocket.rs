//! WebSocket relay.
//!
//! Upgrade requests are replayed on a dedicated connection to the engine.
//! When the worker accepts, the engine's 101 response (selected protocol,
//! cookies and any other headers) goes back to the client, and both upgraded
//! connections are joined byte for byte. Frames are never inspected.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{StatusCode, Uri, Version};
use axum::response::Response;
use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use edge_orchestrator_common::OrchestratorError;
use edge_orchestrator_host::InflightGuard;

use crate::handler::GuardedBody;

/// Relay an upgrade request to the engine socket at `entry`.
///
/// `path` is the origin-form target sent to the engine. The guard is held
/// until the relayed connection closes.
pub async fn relay(
    mut request: Request,
    entry: SocketAddr,
    path: &str,
    guard: InflightGuard,
) -> Result<Response, OrchestratorError> {
    let client_upgrade = hyper::upgrade::on(&mut request);

    let stream = TcpStream::connect(entry)
        .await
        .map_err(|err| OrchestratorError::transport(format!("connect to {entry}: {err}")))?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|err| OrchestratorError::transport(format!("handshake with {entry}: {err}")))?;
    tokio::spawn(async move {
        if let Err(err) = connection.with_upgrades().await {
            debug!(error = %err, "Engine WebSocket connection closed");
        }
    });

    let (mut parts, _body) = request.into_parts();
    parts.uri = path
        .parse::<Uri>()
        .map_err(|err| OrchestratorError::transport(format!("invalid upgrade path: {err}")))?;
    parts.version = Version::HTTP_11;
    let upstream = hyper::Request::from_parts(parts, Empty::<Bytes>::new());

    let mut response = sender
        .send_request(upstream)
        .await
        .map_err(|err| OrchestratorError::transport(format!("upgrade request failed: {err}")))?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(status = %response.status(), "Worker declined WebSocket upgrade");
        return Ok(response.map(|body| GuardedBody::wrap(Body::new(body), guard)));
    }

    let engine_upgrade = hyper::upgrade::on(&mut response);
    tokio::spawn(async move {
        let _guard = guard;
        let (client, engine) = match tokio::try_join!(client_upgrade, engine_upgrade) {
            Ok(upgraded) => upgraded,
            Err(err) => {
                warn!(error = %err, "WebSocket upgrade failed");
                return;
            }
        };

        let mut client = TokioIo::new(client);
        let mut engine = TokioIo::new(engine);
        match tokio::io::copy_bidirectional(&mut client, &mut engine).await {
            Ok((sent, received)) => debug!(sent, received, "WebSocket relay closed"),
            Err(err) => debug!(error = %err, "WebSocket relay ended with error"),
        }
    });

    let (parts, _body) = response.into_parts();
    Ok(Response::from_parts(parts, Body::empty()))
}
