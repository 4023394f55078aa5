//! MCP Host: supervision of stdio JSON-RPC tool servers.
//!
//! This module handles:
//! - Loading server definitions from a config file and the environment
//! - Rewriting launch commands (docker sandbox, package runners, Windows shims)
//! - Spawning server processes and running the initialization handshake
//! - Correlating JSON-RPC responses to concurrent callers over one stdout
//! - Gating calls by risk tier, with human confirmation for MEDIUM risk
//! - Exit monitoring and graceful shutdown

pub mod bridge;
pub mod command;
pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod risk_gate;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use bridge::McpBridge;
pub use config::{BridgeSettings, HighTierPolicy};
pub use errors::{BridgeError, ErrorBody, ErrorKind};
pub use types::{
    ConfirmOutcome, CreatedServer, InitState, InvokeOutcome, RiskTier, SandboxSpec,
    ServerDefinition, ServerSummary,
};
