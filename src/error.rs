//! Error types for the resilience plane

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the resilience plane
pub type Result<T> = std::result::Result<T, Error>;

/// Resilience plane errors
#[derive(Error, Debug)]
pub enum Error {
    /// Circuit is open for a dependency; the operation was not invoked
    #[error("Service '{service}' is temporarily unavailable (circuit open, retry in {}s)", retry_after.as_secs())]
    CircuitOpen {
        /// Dependency name
        service: String,
        /// Time until the next trial call is admitted
        retry_after: Duration,
    },

    /// All retry attempts failed
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Last underlying error
        #[source]
        source: Box<Error>,
    },

    /// Connection-level failure (refused, reset, DNS)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Authorization or permission failure
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Generic failure reported by a wrapped operation
    #[error("Operation failed: {0}")]
    Operation(String),

    /// Object storage unavailable and no cached value exists
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Named entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a generic operation error
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation(message.into())
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Whether this is a fail-fast rejection from an open circuit
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Connection-class failure (including IO errors from the socket layer)
    #[must_use]
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Timeout-class failure
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Authorization or permission failure (never worth retrying)
    #[must_use]
    pub fn is_authorization(&self) -> bool {
        match self {
            Self::Unauthorized(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    /// Failure that may succeed if attempted again
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Operation(_) | Self::StorageUnavailable(_) => true,
            Self::RetriesExhausted { .. } | Self::CircuitOpen { .. } => false,
            _ => self.is_connection() || self.is_timeout(),
        }
    }

    /// HTTP status code a request handler should surface for this error
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::CircuitOpen { .. } | Self::StorageUnavailable(_) => 503,
            Self::Timeout(_) => 504,
            Self::Unauthorized(_) => 403,
            Self::NotFound(_) => 404,
            Self::Config(_) | Self::Json(_) => 400,
            Self::Connection(_) | Self::Operation(_) => 502,
            Self::RetriesExhausted { source, .. } => source.status_code(),
            Self::Io(_) | Self::Internal(_) => 500,
        }
    }

    /// Seconds a client should wait before retrying, when known
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            Self::RetriesExhausted { source, .. } => source.retry_after(),
            _ => None,
        }
    }
}
