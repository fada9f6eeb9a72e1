//! Error types for connection acquisition and teardown.

use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by pool backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for acquisition operations.
pub type AcquireResult<T> = Result<T, AcquireError>;

/// Phase of an acquisition that ran out of time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// TCP reachability check.
    Probe,
    /// Pool creation and handshake.
    Create,
    /// Waiting on another caller creating the same identifier.
    Wait,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Probe => write!(f, "probe"),
            Stage::Create => write!(f, "create"),
            Stage::Wait => write!(f, "wait"),
        }
    }
}

/// Errors surfaced to callers of `acquire_connection`.
///
/// No registry entry exists for an identifier whose acquisition failed.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("cannot reach {host}:{port}: {source}")]
    Connectivity {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open {backend} pool for {host}:{port}: {source}")]
    PoolCreation {
        backend: &'static str,
        host: String,
        port: u16,
        #[source]
        source: BoxError,
    },

    #[error("{stage} timed out after {after:?} for {host}:{port}")]
    Timeout {
        stage: Stage,
        host: String,
        port: u16,
        after: Duration,
    },

    #[error("engine is shutting down, no new connections accepted")]
    ShuttingDown,
}

impl AcquireError {
    /// Whether this error came from the reachability probe.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, AcquireError::Connectivity { .. })
    }

    /// Whether this error is a deadline expiry at any stage.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AcquireError::Timeout { .. })
    }
}

/// Failure while closing an evicted handle. Logged, never propagated.
#[derive(Debug, Error)]
#[error("failed to close {backend} pool for connection {id:?}: {source}")]
pub(crate) struct CloseError {
    pub(crate) backend: &'static str,
    pub(crate) id: String,
    #[source]
    pub(crate) source: BoxError,
}
