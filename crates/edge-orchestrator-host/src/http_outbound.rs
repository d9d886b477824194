//! Outbound network requests made on behalf of workers.
//!
//! Workers without an outbound service or fetch mock, and `network`
//! bindings, reach the internet through the loopback server, which hands the
//! request to an [`OutboundClient`]. The client enforces the service's
//! [`NetworkPermissions`] and performs the request with `reqwest`.

use std::time::Duration;

use bytes::BytesMut;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

use edge_orchestrator_common::{HandlerRequest, HandlerResponse};

use crate::permissions::NetworkPermissions;

/// Largest response body passed back to a worker by default.
pub const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Why an outbound request did not produce a response.
#[derive(Debug, Error)]
pub enum OutboundError {
    /// The host is not in the allowed list.
    #[error("Network access to \"{host}\" is not permitted")]
    PermissionDenied {
        /// The blocked host.
        host: String,
    },
    /// The request URL was not absolute.
    #[error("Invalid outbound URL \"{0}\"")]
    InvalidUrl(String),
    /// The request timed out.
    #[error("Outbound request to {0} timed out")]
    Timeout(String),
    /// Connecting failed.
    #[error("Failed to connect to {0}")]
    ConnectionFailed(String),
    /// The response body exceeded the size limit.
    #[error("Response body exceeds the {0} byte limit")]
    BodyTooLarge(usize),
    /// Any other client error.
    #[error("Outbound request failed: {0}")]
    Other(String),
}

impl OutboundError {
    /// HTTP status the loopback server answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::PermissionDenied { .. } => 403,
            Self::InvalidUrl(_) => 400,
            Self::Timeout(_) => 504,
            Self::ConnectionFailed(_) | Self::BodyTooLarge(_) | Self::Other(_) => 502,
        }
    }
}

/// Performs worker-initiated requests.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct OutboundClient {
    client: Client,
    max_body_bytes: usize,
}

impl OutboundClient {
    /// Create a client with the given request timeout.
    pub fn new(timeout: Duration) -> Result<Self, OutboundError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("edge-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| OutboundError::Other(err.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Create with a custom HTTP client.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            max_body_bytes: MAX_BODY_BYTES,
        }
    }

    /// Limit response bodies to `bytes`.
    #[must_use]
    pub fn with_body_limit(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    /// Perform `request`, whose URI must be absolute.
    ///
    /// Redirects are returned to the worker rather than followed.
    pub async fn fetch(
        &self,
        request: HandlerRequest,
        permissions: &NetworkPermissions,
    ) -> Result<HandlerResponse, OutboundError> {
        let (parts, body) = request.into_parts();
        let target = url::Url::parse(&parts.uri.to_string())
            .map_err(|_| OutboundError::InvalidUrl(parts.uri.to_string()))?;

        if !permissions.is_allowed(&target) {
            let host = target.host_str().unwrap_or_default().to_string();
            warn!(url = %target, "Outbound request blocked: host not allowed");
            return Err(OutboundError::PermissionDenied { host });
        }

        debug!(method = %parts.method, url = %target, "Executing outbound request");

        let mut headers = parts.headers;
        headers.remove(hyper::header::HOST);

        let mut response = self
            .client
            .request(parts.method, target.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    OutboundError::Timeout(target.to_string())
                } else if err.is_connect() {
                    OutboundError::ConnectionFailed(target.to_string())
                } else {
                    OutboundError::Other(err.to_string())
                }
            })?;

        let status = response.status();
        let mut converted = hyper::Response::builder().status(status);
        if let Some(headers) = converted.headers_mut() {
            headers.extend(response.headers().clone());
            // Hop-by-hop; the body is buffered
            headers.remove(hyper::header::TRANSFER_ENCODING);
            headers.remove(hyper::header::CONNECTION);
        }

        let limit = self.max_body_bytes;
        if response
            .content_length()
            .is_some_and(|length| length > limit as u64)
        {
            warn!(url = %target, limit, "Outbound response body too large");
            return Err(OutboundError::BodyTooLarge(limit));
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| OutboundError::Other(err.to_string()))?
        {
            if body.len() + chunk.len() > limit {
                warn!(url = %target, limit, "Outbound response body too large");
                return Err(OutboundError::BodyTooLarge(limit));
            }
            body.extend_from_slice(&chunk);
        }
        let body = body.freeze();

        info!(
            url = %target,
            status = status.as_u16(),
            body_size = body.len(),
            "Outbound request completed"
        );

        converted
            .body(body)
            .map_err(|err| OutboundError::Other(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use axum::{Router, routing::get};
    use bytes::Bytes;
    use hyper::body::Frame;

    /// A body of `remaining` 1 KiB frames with no declared length.
    struct Kilobytes {
        remaining: usize,
    }

    impl hyper::body::Body for Kilobytes {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            if self.remaining == 0 {
                return Poll::Ready(None);
            }
            self.remaining -= 1;
            Poll::Ready(Some(Ok(Frame::data(Bytes::from(vec![b'x'; 1024])))))
        }
    }

    async fn serve(app: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    fn request(uri: &str) -> HandlerRequest {
        hyper::Request::builder()
            .uri(uri)
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let client = OutboundClient::new(Duration::from_secs(5)).unwrap();
        let permissions = NetworkPermissions::new(["allowed.com"]);

        let err = client
            .fetch(request("https://blocked.com/path"), &permissions)
            .await
            .unwrap_err();

        assert!(matches!(&err, OutboundError::PermissionDenied { host } if host == "blocked.com"));
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn test_relative_url_rejected() {
        let client = OutboundClient::new(Duration::from_secs(5)).unwrap();
        let err = client
            .fetch(request("/relative"), &NetworkPermissions::unrestricted())
            .await
            .unwrap_err();
        assert!(matches!(err, OutboundError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_fetch_local_server() {
        let app = Router::new().route(
            "/hello",
            get(|headers: axum::http::HeaderMap| async move {
                let worker = headers
                    .get("cf-worker")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                ([("x-seen-worker", worker)], "hi")
            }),
        );
        let addr = serve(app).await;

        let client = OutboundClient::new(Duration::from_secs(5)).unwrap();
        let req = hyper::Request::builder()
            .uri(format!("http://{addr}/hello"))
            .header("CF-Worker", "api.example.com")
            .body(Bytes::new())
            .unwrap();

        let response = client
            .fetch(req, &NetworkPermissions::unrestricted())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["x-seen-worker"], "api.example.com");
        assert_eq!(response.body().as_ref(), b"hi");
    }

    #[tokio::test]
    async fn test_body_limit() {
        let app = Router::new()
            .route("/declared", get(|| async { vec![b'x'; 4096] }))
            .route(
                "/streamed",
                get(|| async { axum::body::Body::new(Kilobytes { remaining: 64 }) }),
            )
            .route("/small", get(|| async { vec![b'x'; 512] }));
        let addr = serve(app).await;
        let client = OutboundClient::new(Duration::from_secs(5))
            .unwrap()
            .with_body_limit(2048);
        let permissions = NetworkPermissions::unrestricted();

        for path in ["/declared", "/streamed"] {
            let err = client
                .fetch(request(&format!("http://{addr}{path}")), &permissions)
                .await
                .unwrap_err();
            assert!(matches!(err, OutboundError::BodyTooLarge(2048)), "{path}: {err}");
            assert_eq!(err.status_code(), 502);
        }

        let response = client
            .fetch(request(&format!("http://{addr}/small")), &permissions)
            .await
            .unwrap();
        assert_eq!(response.body().len(), 512);
    }
}
