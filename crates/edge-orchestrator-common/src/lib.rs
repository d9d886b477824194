//! Common types, errors, and configuration for edge-orchestrator.
//!
//! This crate provides shared functionality used across the edge-orchestrator workspace:
//! - Worker definitions (code, bindings, routes, compatibility settings)
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures and the TOML configuration file

pub mod config;
pub mod config_file;
pub mod error;
pub mod worker;

pub use config::{EngineConfig, OrchestratorConfig, ProxyConfig, ServerConfig};
pub use config_file::{ConfigFile, ConfigFileError};
pub use error::{OrchestratorError, ValidationError, ValidationIssue, WrappedReason};
pub use worker::{
    BindingKind, BindingSpec, DirectSocket, FetchHandler, FetchMock, HandlerRequest,
    HandlerResponse, InlineHandler, MockInterceptor, ModuleKind, OutboundService, ScriptSource,
    WorkerDefinition, WorkerModule, WorkerRef,
};
