//! Capability values and the binding RPC client.
//!
//! Bindings can return arbitrary shapes: plain data, functions, and objects
//! whose members are themselves callable. The engine encodes these as a
//! [`Capability`] tree; the orchestrator turns that into a [`RemoteValue`]
//! tree whose functions call back into the engine.
//!
//! ```text
//! {"value": 42}
//! {"callable": {"id": "c7"}}
//! {"object": {"name": {"value": "counter"}, "increment": {"callable": {"id": "c8"}}}}
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use edge_orchestrator_common::{HandlerRequest, HandlerResponse, OrchestratorError};

use crate::supervisor::RuntimeProcess;

/// Header naming the worker a forwarded fetch targets.
pub const BINDING_WORKER_HEADER: &str = "MF-Binding-Worker";
/// Header naming the binding a forwarded fetch goes through.
pub const BINDING_NAME_HEADER: &str = "MF-Binding-Name";
/// Header naming the entrypoint a forwarded fetch targets.
pub const ENTRYPOINT_HEADER: &str = "MF-Entrypoint";
/// Header carrying the full URL of a forwarded fetch.
pub const ORIGINAL_URL_HEADER: &str = "MF-Original-URL";

/// Wire encoding of a value produced by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Plain data.
    Value(Value),
    /// A function living in the engine.
    Callable {
        /// Engine-side handle id.
        id: String,
    },
    /// An object whose members are capabilities.
    Object(BTreeMap<String, Capability>),
}

/// Body of `POST /core/rpc`.
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    worker: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    binding: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entrypoint: Option<&'a str>,
    path: &'a [String],
    /// `None` reads the property at `path` instead of calling it.
    args: Option<&'a [Value]>,
}

/// Body of `POST /core/call`.
#[derive(Debug, Serialize)]
struct CallRequest<'a> {
    target: &'a str,
    args: &'a [Value],
}

/// What an RPC addresses: a worker, one of its entrypoints, or a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcTarget {
    /// Worker name.
    pub worker: String,
    /// Binding on that worker.
    pub binding: Option<String>,
    /// Named entrypoint of the worker.
    pub entrypoint: Option<String>,
}

/// Talks to the engine's proxy socket on behalf of one handle.
///
/// Every call first checks that the process generation the handle came
/// from is still serving and fails with `PoisonedStub` otherwise.
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: reqwest::Client,
    process: Arc<RuntimeProcess>,
    name: String,
}

impl RpcClient {
    /// Create a client for the handle called `name`.
    pub fn new(client: reqwest::Client, process: Arc<RuntimeProcess>, name: impl Into<String>) -> Self {
        Self {
            client,
            process,
            name: name.into(),
        }
    }

    /// The same connection under another handle name.
    #[must_use]
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            client: self.client.clone(),
            process: Arc::clone(&self.process),
            name: name.into(),
        }
    }

    /// Name of the handle, used in errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fail unless the handle's process is still serving.
    pub fn ensure_live(&self) -> Result<(), OrchestratorError> {
        if self.process.is_live() {
            Ok(())
        } else {
            Err(OrchestratorError::PoisonedStub {
                name: self.name.clone(),
            })
        }
    }

    fn base(&self) -> Result<String, OrchestratorError> {
        self.ensure_live()?;
        let addr = self
            .process
            .proxy_addr()
            .ok_or_else(|| OrchestratorError::transport("engine has no proxy socket"))?;
        Ok(format!("http://{addr}"))
    }

    /// Call (`args = Some`) or read (`args = None`) the member at `path`.
    pub async fn invoke(
        &self,
        target: &RpcTarget,
        path: &[String],
        args: Option<&[Value]>,
    ) -> Result<RemoteValue, OrchestratorError> {
        let url = format!("{}/core/rpc", self.base()?);
        let body = RpcRequest {
            worker: &target.worker,
            binding: target.binding.as_deref(),
            entrypoint: target.entrypoint.as_deref(),
            path,
            args,
        };
        debug!(handle = %self.name, path = ?path, "Binding RPC");
        let capability = self.post(&url, &body).await?;
        Ok(RemoteValue::from_capability(capability, self))
    }

    /// Call a function handle returned by an earlier RPC.
    pub async fn call(&self, id: &str, args: &[Value]) -> Result<RemoteValue, OrchestratorError> {
        let url = format!("{}/core/call", self.base()?);
        let capability = self.post(&url, &CallRequest { target: id, args }).await?;
        Ok(RemoteValue::from_capability(capability, self))
    }

    async fn post<T: Serialize>(&self, url: &str, body: &T) -> Result<Capability, OrchestratorError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| OrchestratorError::transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            // The body carries the error thrown inside the engine
            let message = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::transport(if message.is_empty() {
                status.to_string()
            } else {
                message
            }));
        }

        response
            .json::<Capability>()
            .await
            .map_err(|err| OrchestratorError::transport(format!("invalid RPC response: {err}")))
    }

    /// Forward a fetch through the proxy socket.
    pub async fn fetch(
        &self,
        target: &RpcTarget,
        request: HandlerRequest,
    ) -> Result<HandlerResponse, OrchestratorError> {
        let base = self.base()?;
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map_or("/", |path| path.as_str());

        let mut headers = parts.headers.clone();
        headers.remove(hyper::header::HOST);

        let mut builder = self
            .client
            .request(parts.method.clone(), format!("{base}{path}"))
            .headers(headers)
            .header(ORIGINAL_URL_HEADER, parts.uri.to_string())
            .header(BINDING_WORKER_HEADER, &target.worker);
        if let Some(binding) = &target.binding {
            builder = builder.header(BINDING_NAME_HEADER, binding);
        }
        if let Some(entrypoint) = &target.entrypoint {
            builder = builder.header(ENTRYPOINT_HEADER, entrypoint);
        }

        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|err| OrchestratorError::transport(err.to_string()))?;

        let mut converted = hyper::Response::builder().status(response.status());
        if let Some(headers) = converted.headers_mut() {
            headers.extend(response.headers().clone());
        }
        let body: Bytes = response
            .bytes()
            .await
            .map_err(|err| OrchestratorError::transport(err.to_string()))?;
        converted
            .body(body)
            .map_err(|err| OrchestratorError::transport(err.to_string()))
    }
}

/// A value returned by a binding, with live functions.
#[derive(Debug, Clone)]
pub enum RemoteValue {
    /// Plain data.
    Value(Value),
    /// A function living in the engine.
    Function(RemoteFunction),
    /// An object whose members are remote values.
    Object(BTreeMap<String, RemoteValue>),
}

impl RemoteValue {
    fn from_capability(capability: Capability, rpc: &RpcClient) -> Self {
        match capability {
            Capability::Value(value) => Self::Value(value),
            Capability::Callable { id } => Self::Function(RemoteFunction {
                id,
                rpc: rpc.clone(),
            }),
            Capability::Object(members) => Self::Object(
                members
                    .into_iter()
                    .map(|(key, member)| (key, Self::from_capability(member, rpc)))
                    .collect(),
            ),
        }
    }

    /// The plain data, if this is a value.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The function, if this is one.
    pub fn as_function(&self) -> Option<&RemoteFunction> {
        match self {
            Self::Function(function) => Some(function),
            _ => None,
        }
    }

    /// An object member.
    pub fn get(&self, key: &str) -> Option<&RemoteValue> {
        match self {
            Self::Object(members) => members.get(key),
            _ => None,
        }
    }
}

/// A callable handle into the engine.
#[derive(Clone)]
pub struct RemoteFunction {
    id: String,
    rpc: RpcClient,
}

impl RemoteFunction {
    /// Engine-side handle id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Call the function.
    pub async fn call(&self, args: &[Value]) -> Result<RemoteValue, OrchestratorError> {
        self.rpc.call(&self.id, args).await
    }
}

impl fmt::Debug for RemoteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFunction")
            .field("id", &self.id)
            .field("handle", &self.rpc.name())
            .finish()
    }
}
