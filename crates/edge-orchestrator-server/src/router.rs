//! HTTP router configuration.
//!
//! The front door has no routes of its own: every path belongs to the
//! workers, so everything falls through to [`handle_request`].

use std::time::Duration;

use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handler::handle_request;
use crate::state::AppState;

/// Build the front door router.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use edge_orchestrator_common::ProxyConfig;
    use edge_orchestrator_host::{OutboundClient, ProcessLauncher, ProcessSupervisor, SupervisorOptions};
    use tower::util::ServiceExt;

    use super::*;

    fn setup_router(secret: Option<&str>) -> (Arc<ProcessSupervisor>, Router) {
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::new(ProcessLauncher::new("/nonexistent/engine")),
            SupervisorOptions::default(),
        ));
        let proxy = ProxyConfig {
            unsafe_proxy_shared_secret: secret.map(str::to_string),
            ..ProxyConfig::default()
        };
        let outbound = OutboundClient::with_client(reqwest::Client::new());
        let state = AppState::new(Arc::clone(&supervisor), proxy, outbound);
        (supervisor, build_router(state, Duration::from_secs(30)))
    }

    fn request(secret: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/anything");
        if let Some(secret) = secret {
            builder = builder.header("MF-Proxy-Shared-Secret", secret);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        request
    }

    #[tokio::test]
    async fn test_secret_rejected_before_engine() {
        let (_supervisor, app) = setup_router(Some("s3cret"));
        let response = app.oneshot(request(Some("wrong"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let (_supervisor, app) = setup_router(None);
        let response = app.oneshot(request(Some("s3cret"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_disposed_supervisor() {
        let (supervisor, app) = setup_router(None);
        supervisor.dispose().await;

        let response = app.oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
