use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors crossing module boundaries. Only `WaylandFatal` terminates the
/// daemon; every other kind is logged and recovered where it occurs.
#[derive(Debug, Error)]
pub enum WsbgError {
    /// Image could not be decoded; the image is disabled for the rest of
    /// the process lifetime.
    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// Shared-memory buffer allocation failed.
    #[error("buffer allocation failed: {0}")]
    Alloc(String),

    /// Malformed or structurally unexpected IPC payload. The message is
    /// discarded; the subscription stays up.
    #[error("sway IPC protocol error: {0}")]
    IpcProtocol(String),

    /// IPC socket error. The socket is closed and not reopened.
    #[error("sway IPC transport error: {0}")]
    IpcTransport(#[from] io::Error),
}

impl WsbgError {
    pub fn alloc(what: impl Into<String>) -> WsbgError {
        WsbgError::Alloc(what.into())
    }
}
