//! Response helpers.
//!
//! Per-request errors never reach the caller as `Err`: the front door turns
//! them into plain-text responses carrying the error message, so a worker's
//! real failure is what the client sees.

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Response, StatusCode};
use bytes::Bytes;

use edge_orchestrator_common::{HandlerResponse, OrchestratorError};

/// Create a plain-text response.
pub fn text_response(status: u16, body: impl Into<String>) -> Response<Body> {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Render an error as a response.
pub fn error_response(err: &OrchestratorError) -> Response<Body> {
    text_response(err.status_code(), err.to_string())
}

/// Convert a handler response into an axum response.
pub fn from_handler_response(response: HandlerResponse) -> Response<Body> {
    response.map(Body::from)
}

/// Build a buffered handler response.
pub fn handler_text(status: u16, body: impl Into<String>) -> HandlerResponse {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = HandlerResponse::new(Bytes::from(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
