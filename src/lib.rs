//! Meridian - recursive memory for AI agents
//!
//! Durable chunk storage with an auto-maintained link graph, and a sandboxed
//! execution session in which agent-written snippets explore that memory
//! through a small read-only capability surface.

pub mod config;
pub mod error;
pub mod graph;
pub mod sandbox;
pub mod search;
pub mod storage;
pub mod types;

pub use config::{MeridianConfig, SessionConfig};
pub use error::{MeridianError, Result};
pub use sandbox::{
    CompletionBackend, CompletionRequest, ExecutionSession, SessionState, StepOutcome, StepReport,
};
pub use storage::{ChunkStore, Storage};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
