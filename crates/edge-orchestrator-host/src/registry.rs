//! Binding proxy registry.
//!
//! A [`BindingProxyRegistry`] is built for one engine generation and hands
//! out handles into it. Handles remember their generation: once it is
//! replaced or disposed they fail with `PoisonedStub` instead of talking to
//! a dead process.
//!
//! Worker lookups distinguish `None` (the entrypoint worker) from `Some("")`
//! (the unnamed worker).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use edge_orchestrator_common::{HandlerRequest, HandlerResponse, OrchestratorError};
use edge_orchestrator_core::{CompiledBinding, WorkerConfig};

use crate::capability::{RemoteValue, RpcClient, RpcTarget};
use crate::supervisor::RuntimeProcess;

/// Hands out handles into one engine generation.
#[derive(Debug, Clone)]
pub struct BindingProxyRegistry {
    process: Arc<RuntimeProcess>,
    client: reqwest::Client,
}

impl BindingProxyRegistry {
    /// Create a registry for `process`.
    pub fn new(process: Arc<RuntimeProcess>, client: reqwest::Client) -> Self {
        Self { process, client }
    }

    /// The generation handles are bound to.
    pub fn process(&self) -> &Arc<RuntimeProcess> {
        &self.process
    }

    fn worker(&self, name: Option<&str>) -> Result<&WorkerConfig, OrchestratorError> {
        let config = self.process.config();
        let name = name.unwrap_or(&config.entrypoint);

        if config.wrapped_only.iter().any(|worker| worker == name) {
            return Err(OrchestratorError::not_found(
                "worker",
                name,
                "addressable workers (it only implements wrapped bindings)",
            ));
        }
        config
            .worker(name)
            .ok_or_else(|| OrchestratorError::not_found("worker", name, "the current configuration"))
    }

    fn rpc(&self, name: String) -> RpcClient {
        RpcClient::new(self.client.clone(), Arc::clone(&self.process), name)
    }

    /// A handle to a worker's default entrypoint.
    pub fn get_worker(&self, name: Option<&str>) -> Result<WorkerStub, OrchestratorError> {
        let worker = self.worker(name)?;
        Ok(WorkerStub {
            target: RpcTarget {
                worker: worker.name.clone(),
                binding: None,
                entrypoint: None,
            },
            rpc: self.rpc(worker.name.clone()),
        })
    }

    /// Handles for every binding of a worker, by binding name.
    pub fn get_bindings(
        &self,
        name: Option<&str>,
    ) -> Result<BTreeMap<String, BindingStub>, OrchestratorError> {
        let worker = self.worker(name)?;
        Ok(worker
            .bindings
            .iter()
            .map(|binding| {
                (
                    binding.name.clone(),
                    self.stub(&worker.name, &binding.name, &binding.kind),
                )
            })
            .collect())
    }

    /// A handle for one binding.
    pub fn get_binding(
        &self,
        worker: Option<&str>,
        binding: &str,
    ) -> Result<BindingStub, OrchestratorError> {
        let config = self.worker(worker)?;
        let found = config
            .bindings
            .iter()
            .find(|candidate| candidate.name == binding)
            .ok_or_else(|| {
                OrchestratorError::not_found(
                    "binding",
                    binding,
                    format!("worker \"{}\"", config.name),
                )
            })?;
        Ok(self.stub(&config.name, &found.name, &found.kind))
    }

    fn typed(
        &self,
        binding: &str,
        worker: Option<&str>,
        expected: &'static str,
    ) -> Result<BindingStub, OrchestratorError> {
        let stub = self.get_binding(worker, binding)?;
        if stub.kind == expected {
            Ok(stub)
        } else {
            Err(OrchestratorError::Unbound {
                binding: binding.to_string(),
                worker: stub.target.worker,
                expected: expected.to_string(),
            })
        }
    }

    /// A KV namespace binding.
    pub fn get_kv_namespace(&self, binding: &str, worker: Option<&str>) -> Result<BindingStub, OrchestratorError> {
        self.typed(binding, worker, "kv_namespace")
    }

    /// An R2 bucket binding.
    pub fn get_r2_bucket(&self, binding: &str, worker: Option<&str>) -> Result<BindingStub, OrchestratorError> {
        self.typed(binding, worker, "r2_bucket")
    }

    /// A D1 database binding.
    pub fn get_d1_database(&self, binding: &str, worker: Option<&str>) -> Result<BindingStub, OrchestratorError> {
        self.typed(binding, worker, "d1_database")
    }

    /// A queue producer binding.
    pub fn get_queue_producer(&self, binding: &str, worker: Option<&str>) -> Result<BindingStub, OrchestratorError> {
        self.typed(binding, worker, "queue_producer")
    }

    /// A Durable Object namespace binding.
    pub fn get_durable_object_namespace(
        &self,
        binding: &str,
        worker: Option<&str>,
    ) -> Result<BindingStub, OrchestratorError> {
        self.typed(binding, worker, "durable_object")
    }

    fn stub(&self, worker: &str, binding: &str, kind: &CompiledBinding) -> BindingStub {
        let local = match kind {
            CompiledBinding::Json { value } => Some(value.clone()),
            _ => None,
        };
        BindingStub {
            kind: kind.type_name(),
            local,
            target: RpcTarget {
                worker: worker.to_string(),
                binding: Some(binding.to_string()),
                entrypoint: None,
            },
            rpc: self.rpc(format!("{worker}.{binding}")),
        }
    }
}

/// A handle to a worker or one of its entrypoints.
#[derive(Debug, Clone)]
pub struct WorkerStub {
    target: RpcTarget,
    rpc: RpcClient,
}

impl WorkerStub {
    /// The worker's name.
    pub fn worker(&self) -> &str {
        &self.target.worker
    }

    /// A handle to a named entrypoint of the same worker.
    #[must_use]
    pub fn entrypoint(&self, entrypoint: impl Into<String>) -> Self {
        let entrypoint = entrypoint.into();
        let mut stub = self.clone();
        stub.rpc = self
            .rpc
            .renamed(format!("{}#{entrypoint}", self.target.worker));
        stub.target.entrypoint = Some(entrypoint);
        stub
    }

    /// Send a request to the worker.
    pub async fn fetch(&self, request: HandlerRequest) -> Result<HandlerResponse, OrchestratorError> {
        self.rpc.fetch(&self.target, request).await
    }

    /// Call an RPC method of the entrypoint.
    pub async fn call(&self, method: &str, args: &[Value]) -> Result<RemoteValue, OrchestratorError> {
        self.rpc
            .invoke(&self.target, &[method.to_string()], Some(args))
            .await
    }

    /// Fail with `PoisonedStub` if the handle's generation was replaced.
    pub fn ensure_live(&self) -> Result<(), OrchestratorError> {
        self.rpc.ensure_live()
    }
}

/// A handle to one binding.
#[derive(Debug, Clone)]
pub struct BindingStub {
    kind: &'static str,
    local: Option<Value>,
    target: RpcTarget,
    rpc: RpcClient,
}

impl BindingStub {
    /// `worker.binding`.
    pub fn name(&self) -> &str {
        self.rpc.name()
    }

    /// Binding type, e.g. `kv_namespace`.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// The value of a JSON binding.
    pub fn value(&self) -> Result<Option<&Value>, OrchestratorError> {
        self.rpc.ensure_live()?;
        Ok(self.local.as_ref())
    }

    /// Send a request through the binding.
    pub async fn fetch(&self, request: HandlerRequest) -> Result<HandlerResponse, OrchestratorError> {
        self.rpc.fetch(&self.target, request).await
    }

    /// Call a method of the binding.
    pub async fn call(&self, method: &str, args: &[Value]) -> Result<RemoteValue, OrchestratorError> {
        self.call_path(&[method.to_string()], args).await
    }

    /// Call a method at a nested path, e.g. `["users", "get"]`.
    pub async fn call_path(
        &self,
        path: &[String],
        args: &[Value],
    ) -> Result<RemoteValue, OrchestratorError> {
        self.rpc.invoke(&self.target, path, Some(args)).await
    }

    /// Read a property of the binding.
    pub async fn property(&self, name: &str) -> Result<RemoteValue, OrchestratorError> {
        self.rpc.invoke(&self.target, &[name.to_string()], None).await
    }

    /// Fail with `PoisonedStub` if the handle's generation was replaced.
    pub fn ensure_live(&self) -> Result<(), OrchestratorError> {
        self.rpc.ensure_live()
    }
}
