//! Header pipeline.
//!
//! Steps applied to requests crossing into the engine, and to requests the
//! engine sends out through the loopback server. The front door runs them in
//! this order:
//!
//! 1. [`check_shared_secret`]
//! 2. [`scrub_internal_headers`]
//! 3. [`set_client_ip`]
//! 4. `MF-Original-Hostname` when the router rewrote the URL to an upstream
//!
//! Responses get [`rewrite_location`] and then content-encoding negotiation
//! (see [`crate::encoding`]). Worker-initiated requests get
//! [`apply_outbound_headers`].

use std::net::IpAddr;

use axum::http::header::LOCATION;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use url::Url;

use edge_orchestrator_common::OrchestratorError;

/// Prefix reserved for internal plumbing headers.
pub const INTERNAL_HEADER_PREFIX: &str = "mf-";

/// Secret sent by a trusted reverse proxy.
pub const PROXY_SHARED_SECRET: &str = "MF-Proxy-Shared-Secret";

/// Original `Host` of a request rewritten to an upstream.
pub const ORIGINAL_HOSTNAME: &str = "MF-Original-Hostname";

/// Target URL of a request forwarded to the loopback server.
pub const ORIGINAL_URL: &str = "MF-Original-URL";

/// Address of the client, as seen by workers.
pub const CF_CONNECTING_IP: &str = "CF-Connecting-IP";

/// Identity of the worker sending an outbound request.
pub const CF_WORKER: &str = "CF-Worker";

const LOOPBACK_IP: &str = "127.0.0.1";

/// Check `MF-Proxy-Shared-Secret` against the configured secret.
///
/// Returns `true` when the request carries the valid secret, `false` when it
/// carries none.
///
/// # Errors
///
/// Returns `ProxySecretMismatch` when the header is present but wrong, or
/// present at all while no secret is configured.
pub fn check_shared_secret(
    headers: &HeaderMap,
    secret: Option<&str>,
) -> Result<bool, OrchestratorError> {
    let Some(value) = headers.get(PROXY_SHARED_SECRET) else {
        return Ok(false);
    };

    let matches = secret.is_some_and(|secret| bool::from(value.as_bytes().ct_eq(secret.as_bytes())));
    if matches {
        Ok(true)
    } else {
        warn!("Rejected request with invalid proxy shared secret");
        Err(OrchestratorError::ProxySecretMismatch {
            header: PROXY_SHARED_SECRET.to_string(),
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        })
    }
}

/// Remove every header with the internal prefix.
pub fn scrub_internal_headers(headers: &mut HeaderMap) {
    let internal: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(INTERNAL_HEADER_PREFIX))
        .cloned()
        .collect();

    for name in internal {
        debug!(header = %name, "Scrubbed internal header");
        headers.remove(&name);
    }
}

/// Set `CF-Connecting-IP` to the peer address unless the client sent one.
pub fn set_client_ip(headers: &mut HeaderMap, peer: IpAddr) {
    if headers.contains_key(CF_CONNECTING_IP) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&peer.to_string()) {
        headers.insert(CF_CONNECTING_IP, value);
    }
}

/// Headers of a request a worker sends to the network.
///
/// `CF-Worker` always names the sending worker. A `CF-Connecting-IP` set by
/// the worker is replaced with the loopback address unless `strip` is off.
pub fn apply_outbound_headers(headers: &mut HeaderMap, cf_worker: &str, strip: bool) {
    if let Ok(value) = HeaderValue::from_str(cf_worker) {
        headers.insert(CF_WORKER, value);
    }
    if strip && headers.contains_key(CF_CONNECTING_IP) {
        headers.insert(CF_CONNECTING_IP, HeaderValue::from_static(LOOPBACK_IP));
    }
}

/// Resolve a relative `Location` against the URL the client requested.
pub fn rewrite_location(headers: &mut HeaderMap, original: &Url) {
    let Some(location) = headers.get(LOCATION).and_then(|value| value.to_str().ok()) else {
        return;
    };
    if Url::parse(location).is_ok() {
        return;
    }

    let resolved = match original.join(location) {
        Ok(resolved) => resolved,
        Err(err) => {
            debug!(location, error = %err, "Left unresolvable Location header as is");
            return;
        }
    };
    if let Ok(value) = HeaderValue::from_str(resolved.as_str()) {
        headers.insert(LOCATION, value);
    }
}
