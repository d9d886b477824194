//! HTTP front door and public API for edge-orchestrator.
//!
//! This crate puts the engine behind two HTTP servers:
//!
//! - the **front door**, where clients send requests: header pipeline,
//!   routing to a worker, forwarding to the engine, content-encoding
//!   negotiation and WebSocket relay
//! - the **loopback server**, where the engine sends requests that Rust
//!   code answers: custom handlers, fetch mocks and outbound network access
//!
//! [`Orchestrator`] ties them to a process supervisor.
//!
//! # Quick Start
//!
//! ```ignore
//! use edge_orchestrator_common::{OrchestratorConfig, WorkerDefinition};
//! use edge_orchestrator_server::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workers = vec![WorkerDefinition::module("api", "export default {}")];
//!     let orchestrator = Orchestrator::new(OrchestratorConfig::default(), workers).await?;
//!
//!     let url = orchestrator.ready().await?;
//!     let response = reqwest::get(url).await?;
//!     println!("{}", response.text().await?);
//!
//!     orchestrator.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod encoding;
pub mod handler;
pub mod loopback;
pub mod orchestrator;
pub mod pipeline;
pub mod response;
pub mod router;
pub mod server;
pub mod state;
pub mod websocket;

pub use orchestrator::Orchestrator;
pub use server::ServerHandle;
pub use state::AppState;
