//! Engine process supervision and binding proxies for edge-orchestrator.
//!
//! This crate owns everything that talks to the engine process:
//!
//! - [`process`]: spawning the engine and waiting for its sockets
//! - [`supervisor`]: one serving generation at a time, restarts, draining
//! - [`registry`]: handles to workers and bindings inside a generation
//! - [`capability`]: values returned by binding RPC
//! - [`http_outbound`]: worker-initiated network requests
//! - [`permissions`]: which hosts those requests may reach
//! - [`logging`]: forwarding engine output through `tracing`
//!
//! # Generations
//!
//! Every successful restart creates a new [`RuntimeProcess`]. Handles from the
//! registry are tied to the generation they were created from:
//!
//! 1. **Live**: the generation is serving, calls go through.
//! 2. **Poisoned**: the generation was replaced or disposed, every call fails
//!    with `PoisonedStub` without touching the network.

pub mod capability;
pub mod http_outbound;
pub mod logging;
pub mod permissions;
pub mod process;
pub mod registry;
pub mod supervisor;

pub use capability::{Capability, RemoteFunction, RemoteValue};
pub use http_outbound::{OutboundClient, OutboundError};
pub use logging::EngineLog;
pub use permissions::NetworkPermissions;
pub use process::{EngineInstance, EngineLauncher, LaunchOptions, ProcessLauncher};
pub use registry::{BindingProxyRegistry, BindingStub, WorkerStub};
pub use supervisor::{
    Applied, InflightGuard, ProcessState, ProcessSupervisor, ReadyState, RuntimeProcess,
    SupervisorOptions,
};
