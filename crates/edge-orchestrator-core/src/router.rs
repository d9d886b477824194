//! Request routing over a compiled configuration.
//!
//! The [`Router`] is built once per configuration generation and is
//! immutable afterwards; a reconfiguration builds a new one.

use std::collections::BTreeMap;

use tracing::trace;
use url::Url;

use edge_orchestrator_common::OrchestratorError;

use crate::routes::{RouteEntry, match_route};
use crate::runtime_config::{RuntimeConfig, direct_socket_name};

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Worker receiving the request.
    pub worker: String,
    /// URL the worker sees.
    pub url: Url,
    /// Original `host[:port]`, set only when an upstream rewrite happened.
    pub original_hostname: Option<String>,
}

/// Matches URLs against the route table.
#[derive(Debug, Clone)]
pub struct Router {
    entrypoint: String,
    routes: Vec<RouteEntry>,
    upstreams: BTreeMap<String, Url>,
    workers: Vec<String>,
    direct_sockets: Vec<String>,
}

impl Router {
    /// Build a router for a compiled configuration.
    pub fn new(config: &RuntimeConfig) -> Self {
        let upstreams = config
            .upstreams
            .iter()
            .filter_map(|(worker, upstream)| {
                // Validated during compilation
                Url::parse(upstream).ok().map(|url| (worker.clone(), url))
            })
            .collect();

        Self {
            entrypoint: config.entrypoint.clone(),
            routes: config.routes.clone(),
            upstreams,
            workers: config.workers.clone(),
            direct_sockets: config
                .sockets
                .iter()
                .filter(|socket| socket.name.starts_with("direct:"))
                .map(|socket| socket.name.clone())
                .collect(),
        }
    }

    /// The entrypoint worker.
    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    /// Route a request URL.
    ///
    /// The most specific matching route wins; without a match the request
    /// goes to the entrypoint worker. When the chosen worker has an upstream,
    /// the URL's origin is replaced by the upstream's while the path and
    /// query are kept.
    pub fn route(&self, url: &Url) -> RouteTarget {
        let worker = match_route(&self.routes, url).unwrap_or(&self.entrypoint);
        trace!(%url, worker = %worker, "Routed request");

        match self.upstreams.get(worker) {
            Some(upstream) => {
                let mut inner = upstream.clone();
                inner.set_path(url.path());
                inner.set_query(url.query());
                inner.set_fragment(None);
                RouteTarget {
                    worker: worker.to_string(),
                    url: inner,
                    original_hostname: Some(host_with_port(url)),
                }
            }
            None => RouteTarget {
                worker: worker.to_string(),
                url: url.clone(),
                original_hostname: None,
            },
        }
    }

    /// Resolve a worker name; `None` means the entrypoint.
    pub fn resolve_worker<'a>(&'a self, name: Option<&'a str>) -> Result<&'a str, OrchestratorError> {
        let name = name.unwrap_or(&self.entrypoint);
        if self.workers.iter().any(|worker| worker == name) {
            Ok(name)
        } else {
            Err(OrchestratorError::not_found("worker", name, "the current configuration"))
        }
    }

    /// Name of the socket serving a direct entrypoint.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the worker doesn't exist or didn't declare a
    /// direct socket for `entrypoint`.
    pub fn direct_route(
        &self,
        worker: Option<&str>,
        entrypoint: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let worker = self.resolve_worker(worker)?;
        let socket = direct_socket_name(worker, entrypoint);
        if self.direct_sockets.contains(&socket) {
            Ok(socket)
        } else {
            Err(OrchestratorError::not_found(
                "direct socket",
                entrypoint.unwrap_or("default"),
                format!("`unsafe_direct_sockets` of worker \"{worker}\""),
            ))
        }
    }
}

/// `host[:port]` of a URL, omitting default ports.
pub fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}
