//! mcp-smoke - Multi-transport smoke and conformance harness for MCP services
//!
//! Each transport mode starts its own service instance through a platform
//! supervisor, drives a fixed JSON-RPC script over the matching channel and
//! folds the outcome into a [`FinalReport`](mcp_smoke_core::FinalReport).

pub mod channel;
pub mod console;
pub mod error;
pub mod factory;
pub mod http_probe;
pub mod orchestrator;
pub mod precondition;
pub mod scenario;
pub mod sse_parser;

pub use error::ChannelError;
pub use orchestrator::{Orchestrator, Reporter};

// Re-export core functionality
pub use mcp_smoke_core::*;
