//! MCP host error types.

use serde::Serialize;
use thiserror::Error;

use super::types::InitState;

/// Stable, machine-readable error classification exposed to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyRunning,
    NotInitialized,
    Timeout,
    Expired,
    SandboxMisconfigured,
    RemoteError,
    SpawnFailed,
    Transport,
    Config,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::NotInitialized => "not_initialized",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Expired => "expired",
            ErrorKind::SandboxMisconfigured => "sandbox_misconfigured",
            ErrorKind::RemoteError => "remote_error",
            ErrorKind::SpawnFailed => "spawn_failed",
            ErrorKind::Transport => "transport",
            ErrorKind::Config => "config",
        }
    }
}

/// Errors that can occur while supervising or calling MCP servers.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No server is registered under this id.
    #[error("server '{server}' not found or not connected")]
    ServerNotFound { server: String },

    /// No pending confirmation with this id (never issued or already consumed).
    #[error("confirmation '{confirmation_id}' not found or expired")]
    ConfirmationNotFound { confirmation_id: String },

    /// A live process is already registered under this id.
    #[error("server with id '{server}' already exists")]
    AlreadyRunning { server: String },

    /// The server has not completed the initialization handshake.
    ///
    /// `state` is `None` when the registry has no state for the id.
    #[error("{}. Current state: {}", not_ready_message(.state), state_label(.state))]
    NotInitialized {
        server: String,
        state: Option<InitState>,
    },

    /// The handshake or a single request did not complete in time.
    #[error("{operation} on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// A pending confirmation outlived its window.
    #[error("confirmation '{confirmation_id}' has expired")]
    Expired { confirmation_id: String },

    /// HIGH risk server without a usable sandbox config.
    #[error("server '{server}' has HIGH risk level but {reason}")]
    SandboxMisconfigured { server: String, reason: String },

    /// The server answered with a JSON-RPC error object.
    #[error("server '{server}' returned error [{code}]: {message}")]
    RemoteError {
        server: String,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The OS refused to launch the process.
    #[error("failed to spawn server '{server}': {reason}")]
    SpawnFailed { server: String, reason: String },

    /// I/O failure on the process pipes, or the process went away mid-call.
    #[error("transport error for server '{server}': {reason}")]
    Transport { server: String, reason: String },

    /// Configuration could not be read or parsed.
    #[error("config error: {reason}")]
    Config { reason: String },
}

/// Serializable error payload handed to collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::ServerNotFound { .. } | BridgeError::ConfirmationNotFound { .. } => {
                ErrorKind::NotFound
            }
            BridgeError::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            BridgeError::NotInitialized { .. } => ErrorKind::NotInitialized,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::Expired { .. } => ErrorKind::Expired,
            BridgeError::SandboxMisconfigured { .. } => ErrorKind::SandboxMisconfigured,
            BridgeError::RemoteError { .. } => ErrorKind::RemoteError,
            BridgeError::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            BridgeError::Transport { .. } => ErrorKind::Transport,
            BridgeError::Config { .. } => ErrorKind::Config,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

fn not_ready_message(state: &Option<InitState>) -> &'static str {
    match state {
        Some(InitState::Starting) => "Server is still starting up",
        Some(InitState::Timeout) => "Server initialization timed out",
        Some(InitState::Error) => "Server initialization failed",
        Some(InitState::Exited) => "Server process has exited",
        Some(InitState::Initialized) | None => "Server is not properly initialized",
    }
}

fn state_label(state: &Option<InitState>) -> &'static str {
    state.map(InitState::as_str).unwrap_or("unknown")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
