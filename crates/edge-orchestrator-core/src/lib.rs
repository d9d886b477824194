//! Configuration compiler and route table for edge-orchestrator.
//!
//! This crate turns user-facing worker definitions into the document the
//! engine runs, and answers routing questions about it:
//! - [`ConfigCompiler`]: validation, wrapped-binding checks, compatibility
//!   flags, sockets and services
//! - [`RuntimeConfig`]: the compiled, deterministic configuration
//! - [`Router`]: route matching, upstream rewriting and direct sockets
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 [WorkerDefinition]                      │
//! │  (User input: code, bindings, routes)                   │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ConfigCompiler                        │
//! │  - Shape validation                                     │
//! │  - Wrapped-binding graph + cycle detection              │
//! │  - Compatibility flag resolution                        │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          RuntimeConfig  +  loopback handlers            │
//! │  (Engine input)            (Served by the orchestrator) │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Router                            │
//! │  (Per generation, immutable)                            │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod compat;
pub mod compiler;
pub mod graph;
pub mod router;
pub mod routes;
pub mod runtime_config;

pub use compiler::{CompileOptions, Compilation, ConfigCompiler, LoopbackHandler};
pub use router::{RouteTarget, Router};
pub use routes::{RouteEntry, RoutePattern};
pub use runtime_config::{
    BindingConfig, CompiledBinding, RuntimeConfig, ServiceConfig, ServiceDesignator, ServiceKind,
    SocketConfig, WorkerConfig,
};
