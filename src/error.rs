//! Error types for markup-bridge.

use thiserror::Error;

/// Main error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// I/O error on the transport or the child process pipes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Framing error (missing or malformed Content-Length header).
    ///
    /// Fatal to the connection it occurred on. The parse buffer is left
    /// untouched so the caller can still inspect the offending bytes.
    #[error("Framing error: {0}")]
    Framing(String),

    /// The RPC session to the backend closed or broke mid-call.
    #[error("Backend session closed")]
    SessionClosed,

    /// A backend request outlived its deadline.
    #[error("Backend request timed out")]
    Timeout,

    /// The backend executable could not be spawned.
    #[error("Failed to launch backend: {0}")]
    Launch(String),
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
