//! Loopback server.
//!
//! The engine reaches handlers that live in this process through
//! `/core/loopback/{service}`. The request's real target travels in
//! `MF-Original-URL`; internal headers are scrubbed before a handler sees
//! the request.

use axum::Router;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::Response;
use axum::routing::any;
use bytes::Bytes;
use http_body_util::BodyExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument, warn};
use url::Url;

use edge_orchestrator_common::{FetchMock, HandlerRequest, HandlerResponse};
use edge_orchestrator_core::LoopbackHandler;
use edge_orchestrator_host::NetworkPermissions;

use crate::pipeline::{ORIGINAL_URL, apply_outbound_headers, scrub_internal_headers};
use crate::response::{from_handler_response, handler_text, text_response};
use crate::state::AppState;

/// Build the loopback router.
pub fn build_loopback_router(state: AppState) -> Router {
    Router::new()
        .route("/core/loopback/:service", any(handle_loopback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[instrument(skip(state, request), fields(method = %request.method()))]
async fn handle_loopback(
    State(state): State<AppState>,
    Path(service): Path<String>,
    request: Request,
) -> Response {
    let handlers = state.handlers();
    let Some(handler) = handlers.get(&service) else {
        warn!("Unknown loopback service");
        return text_response(404, format!("Unknown loopback service \"{service}\""));
    };

    let (mut parts, body) = request.into_parts();
    let target = parts
        .headers
        .get(ORIGINAL_URL)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<Uri>().ok());
    let Some(target) = target else {
        return text_response(400, format!("Missing or invalid {ORIGINAL_URL} header"));
    };
    scrub_internal_headers(&mut parts.headers);
    parts.uri = target;

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => return text_response(400, format!("Failed to read request body: {err}")),
    };
    let request = HandlerRequest::from_parts(parts, body);
    debug!(url = %request.uri(), "Dispatching loopback request");

    let response = match handler {
        LoopbackHandler::Custom(handler) => handler.0.fetch(request).await,
        LoopbackHandler::FetchMock(mock) => mock_response(mock, &request),
        LoopbackHandler::Network {
            allowed_hosts,
            cf_worker,
        } => {
            let (mut parts, body) = request.into_parts();
            apply_outbound_headers(&mut parts.headers, cf_worker, state.proxy().strip_cf_connecting_ip);
            let permissions = NetworkPermissions::new(allowed_hosts.iter().map(String::as_str));
            match state
                .outbound()
                .fetch(HandlerRequest::from_parts(parts, body), &permissions)
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    warn!(error = %err, "Outbound request failed");
                    handler_text(err.status_code(), err.to_string())
                }
            }
        }
    };

    from_handler_response(response)
}

/// Answer from the first matching interceptor.
fn mock_response(mock: &FetchMock, request: &HandlerRequest) -> HandlerResponse {
    let url = request.uri().to_string();
    let Ok(parsed) = Url::parse(&url) else {
        return handler_text(500, format!("No mock found for {} {url}", request.method()));
    };
    let origin = parsed.origin().ascii_serialization();
    let path = match parsed.query() {
        Some(query) => format!("{}?{query}", parsed.path()),
        None => parsed.path().to_string(),
    };

    let interceptor = mock.interceptors.iter().find(|interceptor| {
        let same_origin = Url::parse(&interceptor.origin)
            .is_ok_and(|origin_url| origin_url.origin().ascii_serialization() == origin);
        let same_method = interceptor
            .method
            .as_deref()
            .is_none_or(|method| method.eq_ignore_ascii_case(request.method().as_str()));
        same_origin && same_method && interceptor.path == path
    });

    let Some(interceptor) = interceptor else {
        debug!(%url, "No interceptor matched");
        return handler_text(500, format!("No mock found for {} {url}", request.method()));
    };

    let mut response = HandlerResponse::new(Bytes::from(interceptor.body.clone()));
    *response.status_mut() =
        StatusCode::from_u16(interceptor.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in &interceptor.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}
