use std::io;

use thiserror::Error;

/// Error kinds surfaced to RPC callers, each with a stable numeric code.
/// Infrastructure errors are wrapped rather than flattened so subsystem
/// boundaries can attach context with `.map_err`.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("operation aborted by user")]
    Aborted,

    #[error("no launch candidates found")]
    NoLaunchCandidates,

    #[error("install folder disappeared: {0}")]
    InstallFolderDisappeared(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("network disconnected: {0}")]
    NetworkDisconnected(String),

    #[error("patch corrupt: {0}")]
    PatchCorrupt(String),

    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),

    #[error("wounded file: {0}")]
    WoundedFile(String),

    #[error("installer needs a local file: {0}")]
    NeedLocal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("lock held by pid {pid}: {reason}")]
    LockHeld { pid: u32, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Stable numeric RPC code.
    pub fn code(&self) -> i64 {
        match self {
            CoreError::Cancelled => 499,
            CoreError::Aborted => 498,
            CoreError::NoLaunchCandidates => 404_001,
            CoreError::InstallFolderDisappeared(_) => 404_002,
            CoreError::Unauthenticated => 401_001,
            CoreError::NetworkDisconnected(_) => 503_001,
            CoreError::PatchCorrupt(_) => 409_001,
            CoreError::SignatureMismatch(_) => 409_002,
            CoreError::WoundedFile(_) => 409_003,
            CoreError::NeedLocal(_) => 409_004,
            CoreError::NotFound(_) => 404_000,
            CoreError::LockHeld { .. } => 423_000,
            CoreError::Config(_) => 500_001,
            CoreError::Io(_) => 500_002,
            CoreError::Database(_) => 500_003,
            CoreError::Json(_) => 500_004,
            CoreError::Http(_) => 500_005,
        }
    }

    /// Cancellation is a control-flow signal, not a failure; call sites
    /// should log it at `debug`, never `error`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }

    /// Whether the install state machine should retry this error (bounded,
    /// exponential backoff) rather than treat it as fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::NetworkDisconnected(_) | CoreError::Http(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_not_logged_as_error() {
        assert!(CoreError::Cancelled.is_cancellation());
        assert!(!CoreError::Config("x".into()).is_cancellation());
    }

    #[test]
    fn network_errors_are_retryable_fatal_are_not() {
        assert!(CoreError::NetworkDisconnected("timeout".into()).is_retryable());
        assert!(!CoreError::Config("disk full".into()).is_retryable());
    }
}
