use crate::types::Snapshot;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Stable failure codes shared by the RESP API and the realtime ack frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Authorization,
    Conflict,
    TransientIo,
    FatalConfiguration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Conflict => "conflict",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::FatalConfiguration => "fatal_configuration",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "validation" => Some(ErrorKind::Validation),
            "authorization" => Some(ErrorKind::Authorization),
            "conflict" => Some(ErrorKind::Conflict),
            "transient_io" => Some(ErrorKind::TransientIo),
            "fatal_configuration" => Some(ErrorKind::FatalConfiguration),
            _ => None,
        }
    }

    /// Only transient failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientIo)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("validation failure: {0}")]
    Validation(String),

    #[error("authorization failure: {0}")]
    Authorization(String),

    /// The optimistic-concurrency guard tripped; carries the authoritative state
    #[error("conflict: server is at version {}", .0.version)]
    Conflict(Box<Snapshot>),

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("fatal configuration failure: {0}")]
    FatalConfiguration(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Authorization(_) => ErrorKind::Authorization,
            SyncError::Conflict(_) => ErrorKind::Conflict,
            SyncError::TransientIo(_) => ErrorKind::TransientIo,
            SyncError::FatalConfiguration(_) => ErrorKind::FatalConfiguration,
        }
    }

    /// Rebuild an error reported by a remote peer.
    ///
    /// A conflict cannot be rebuilt without its snapshot, so it degrades to a
    /// transient failure; callers that can see conflicts decode them explicitly.
    pub fn from_remote(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Validation => SyncError::Validation(message),
            ErrorKind::Authorization => SyncError::Authorization(message),
            ErrorKind::FatalConfiguration => SyncError::FatalConfiguration(message),
            ErrorKind::Conflict | ErrorKind::TransientIo => SyncError::TransientIo(message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::TransientIo(format!("storage: {}", e))
    }
}

impl From<r2d2::Error> for SyncError {
    fn from(e: r2d2::Error) -> Self {
        SyncError::TransientIo(format!("connection pool: {}", e))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::TransientIo(format!("io: {}", e))
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SyncError::TransientIo("request timed out".to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Validation(format!("malformed json: {}", e))
    }
}
