//! Pool backends, the per-engine pool factories.
//!
//! Each supported database engine implements [`PoolBackend`]: it knows how to
//! open a pooled-connection handle from a [`ConnectionDescriptor`] and how to
//! tear one down. Everything else (caching, reaping, probing) is shared.
//!
//! ```text
//! Engine<B>
//!   → ConnectionDescriptor::build(B::kind(), target)
//!     → B::open(descriptor)   → Handle (cached by the registry)
//!     → B::close(handle)      ← Reaper / shutdown
//! ```

pub mod mysql;
pub mod postgres;

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_str;
use crate::descriptor::ConnectionDescriptor;
use crate::error::BoxError;

pub use mysql::MySql;
pub use postgres::Postgres;

/// Database engine a backend speaks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Postgres,
    MySql,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Postgres => "postgres",
            BackendKind::MySql => "mysql",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sizing applied to every pool a backend opens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolLimits {
    /// Connections kept open even when idle.
    pub min_connections: u32,
    /// Upper bound on open connections per pool.
    pub max_connections: u32,
    /// Connections older than this are recycled.
    #[serde(with = "duration_str")]
    pub max_lifetime: Duration,
    /// Connections idle inside the pool longer than this are closed.
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
    /// How long a checkout from the pool may wait.
    #[serde(with = "duration_str")]
    pub acquire_timeout: Duration,
}

impl PoolLimits {
    /// Postgres defaults: at least four connections, or one per CPU.
    pub fn postgres() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4);
        Self {
            min_connections: 0,
            max_connections: cpus.max(4),
            max_lifetime: Duration::from_secs(60 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
            acquire_timeout: Duration::from_secs(30),
        }
    }

    /// MySQL defaults.
    pub fn mysql() -> Self {
        Self {
            min_connections: 0,
            max_connections: 10,
            max_lifetime: Duration::from_secs(60 * 60),
            idle_timeout: Duration::from_secs(10 * 60),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self::postgres()
    }
}

/// Opens and closes pooled-connection handles for one database engine.
///
/// The handle must be cheap to clone and safe to share between tasks; the
/// registry hands clones to every caller of the same identifier.
pub trait PoolBackend: Send + Sync + 'static {
    /// Shared pooled-connection handle.
    type Handle: Clone + Send + Sync + 'static;

    /// Engine this backend targets. Selects DSN rendering and log labels.
    fn kind(&self) -> BackendKind;

    /// Open a pool and complete at least one handshake.
    ///
    /// Authentication, protocol and TLS failures are returned as errors.
    fn open(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> impl Future<Output = Result<Self::Handle, BoxError>> + Send;

    /// Close every connection held by `handle`.
    fn close(&self, handle: Self::Handle) -> impl Future<Output = Result<(), BoxError>> + Send;
}
