//! Error types for voxrelay sessions

use thiserror::Error;

/// Result type alias for session core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while driving a session
#[derive(Debug, Error)]
pub enum Error {
    /// The duplex channel could not be opened or failed mid-stream
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation attempted in an incompatible lifecycle state
    #[error("Invalid state for {operation}: {reason}")]
    InvalidState {
        /// Operation that was rejected
        operation: &'static str,
        /// Why the current state does not allow it
        reason: String,
    },

    /// A session with this id is already registered
    #[error("Session already registered: {0}")]
    DuplicateSession(String),

    /// Graceful teardown did not finish within its bound
    #[error("Session {session_id} cleanup timed out after {timeout_ms}ms")]
    SessionCleanupTimeout {
        /// Session being cleaned up
        session_id: String,
        /// Bound that was exceeded
        timeout_ms: u64,
    },

    /// An external tool or knowledge lookup failed
    #[error("Tool invocation failed for {tool}: {message}")]
    ToolInvocation {
        /// Tool name
        tool: String,
        /// Failure detail
        message: String,
    },

    /// No session with this id is registered
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The registry no longer admits sessions
    #[error("Shutting down, not accepting new sessions")]
    ShuttingDown,

    /// Inbound payload could not be decoded
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid_state(operation: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidState {
            operation,
            reason: reason.into(),
        }
    }

    /// Short machine-readable kind, used as the `source` of error events
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Connection(_) => "connection",
            Error::InvalidState { .. } => "invalidState",
            Error::DuplicateSession(_) => "duplicateSession",
            Error::SessionCleanupTimeout { .. } => "cleanupTimeout",
            Error::ToolInvocation { .. } => "toolInvocation",
            Error::SessionNotFound(_) => "sessionNotFound",
            Error::ShuttingDown => "shuttingDown",
            Error::InvalidPayload(_) => "invalidPayload",
            Error::Serialization(_) => "serialization",
        }
    }
}
