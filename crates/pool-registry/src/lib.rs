//! pool-registry: cached database connection pools keyed by connection id.
//!
//! Callers identify logical connections by an opaque string id. The first
//! acquisition of an id probes the target over TCP, opens a backend pool and
//! caches it; later acquisitions share the cached handle. Pools unused for
//! longer than the idle threshold are evicted and closed in the background.
//!
//! - **engine**: [`Engine`] per backend, [`ConnectionEngine`] contract
//! - **registry**: single-flight map of id → pooled handle
//! - **reaper**: idle sweeps and background close
//! - **probe**: bounded TCP reachability check
//! - **descriptor**: target parameters, DSN rendering, SSL mode mapping
//! - **backend**: Postgres and MySQL pool factories over sqlx
//! - **config**: TOML configuration
//!
//! ```no_run
//! use std::time::Duration;
//! use pool_registry::{BackendTarget, ConnectionEngine, EngineConfig, PostgresEngine};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = PostgresEngine::postgres(&EngineConfig::default())?;
//! engine.start_reaper().await;
//!
//! let target = BackendTarget::new("db.internal", 5432, "orders", "svc", "hunter2")
//!     .with_encryption(true);
//! let pool = engine
//!     .acquire_connection("orders-primary", &target, Duration::from_secs(10))
//!     .await?;
//! sqlx::query("SELECT 1").execute(&pool).await?;
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod probe;
pub mod reaper;
pub mod registry;

pub use backend::{BackendKind, MySql, PoolBackend, PoolLimits, Postgres};
pub use config::{EngineConfig, RegistryConfig};
pub use descriptor::{BackendTarget, ConnectionDescriptor, Secret, SslMode, SslModeMapping};
pub use engine::{ConnectionEngine, Engine, MySqlEngine, PostgresEngine, ShutdownReport};
pub use error::{AcquireError, AcquireResult, BoxError, Stage};
pub use reaper::{Reaper, ReaperHandle, SweepReport};
pub use registry::{ConnectionRegistry, EntryInfo};
