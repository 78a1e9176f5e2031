//! mcp-smoke core - Platform-independent harness building blocks
//!
//! Configuration, the JSON-RPC wire codec, process and supervisor abstractions,
//! diagnostic draining and the report model shared by the platform crates and
//! the harness binary.

mod codec;
mod config;
mod diagnostics;
mod error;
mod process;
mod report;
mod supervisor;

pub use codec::*;
pub use config::*;
pub use diagnostics::*;
pub use error::*;
pub use process::*;
pub use report::*;
pub use supervisor::*;
