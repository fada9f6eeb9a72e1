//! Connection engine: the public entry point for acquiring pooled handles.
//!
//! One `Engine` exists per backend. It owns the backend, the registry of
//! cached pools, and (optionally) a background reaper.
//!
//! ```text
//! acquire_connection(id, target, timeout)
//!   ├─ shutting down?          → ShuttingDown
//!   ├─ id == ""                → probe → open          (ephemeral, not cached)
//!   └─ registry.get_or_create  → hit: touch + clone
//!                              → miss: probe → open → cache
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{MySql, PoolBackend, Postgres};
use crate::config::{EngineConfig, RegistryConfig};
use crate::descriptor::{BackendTarget, ConnectionDescriptor};
use crate::error::{AcquireError, AcquireResult, Stage};
use crate::probe::probe;
use crate::reaper::{Reaper, ReaperHandle, SweepReport, close_handle};
use crate::registry::{ConnectionRegistry, EntryInfo};

/// Postgres engine over `sqlx::PgPool`.
pub type PostgresEngine = Engine<Postgres>;

/// MySQL engine over `sqlx::MySqlPool`.
pub type MySqlEngine = Engine<MySql>;

/// Contract shared by every backend engine.
pub trait ConnectionEngine: Send + Sync {
    type Handle: Clone + Send + Sync + 'static;

    /// Return a pooled handle for `id`, creating the pool on first use.
    ///
    /// An empty `id` yields a fresh pool that is not cached; the caller owns
    /// it. Every failure leaves no registry entry for `id`.
    fn acquire_connection(
        &self,
        id: &str,
        target: &BackendTarget,
        timeout: Duration,
    ) -> impl Future<Output = AcquireResult<Self::Handle>> + Send;

    /// Evict and close every pool idle past the configured threshold.
    fn release_idle_connections(&self) -> impl Future<Output = SweepReport> + Send;
}

/// Result of [`Engine::shutdown`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub closed: usize,
    pub failed: usize,
}

pub struct Engine<B: PoolBackend> {
    backend: Arc<B>,
    registry: Arc<ConnectionRegistry<B::Handle>>,
    config: RegistryConfig,
    reaper: Mutex<Option<ReaperHandle>>,
    shutting_down: AtomicBool,
}

impl Engine<Postgres> {
    /// Postgres engine sized by `config.postgres`.
    pub fn postgres(config: &EngineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Self::new(Postgres::new(config.postgres.clone()), config.registry.clone())
    }
}

impl Engine<MySql> {
    /// MySQL engine sized by `config.mysql`.
    pub fn mysql(config: &EngineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Self::new(MySql::new(config.mysql.clone()), config.registry.clone())
    }
}

impl<B: PoolBackend> Engine<B> {
    /// Build an engine around `backend`. Fails if `config` is invalid.
    pub fn new(backend: B, config: RegistryConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid registry config")?;
        Ok(Self {
            backend: Arc::new(backend),
            registry: Arc::new(ConnectionRegistry::new()),
            config,
            reaper: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &ConnectionRegistry<B::Handle> {
        &self.registry
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn reaper(&self) -> Reaper<B> {
        Reaper::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.registry),
            self.config.idle_threshold,
        )
    }

    /// Start sweeping every `reap_interval`. Returns `false` if a reaper is
    /// already running or the engine is shutting down.
    pub async fn start_reaper(&self) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let mut slot = self.reaper.lock().await;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        *slot = Some(self.reaper().spawn(self.config.reap_interval));
        true
    }

    /// Stop the background reaper, if any.
    pub async fn stop_reaper(&self) {
        let handle = self.reaper.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    /// Probe the target, then open a pool before `deadline`.
    async fn open_pool(
        &self,
        target: &BackendTarget,
        deadline: Instant,
        timeout: Duration,
    ) -> AcquireResult<B::Handle> {
        let kind = self.backend.kind();
        probe(&target.host, target.port, self.config.dial_timeout.min(timeout)).await?;

        let descriptor = ConnectionDescriptor::build(kind, target, &self.config.ssl_mode_mapping);
        debug!(backend = %kind, %descriptor, "opening pool");

        match tokio::time::timeout_at(deadline, self.backend.open(&descriptor)).await {
            Ok(Ok(handle)) => {
                info!(
                    backend = %kind,
                    host = %target.host,
                    port = target.port,
                    database = %target.database,
                    ssl_mode = %descriptor.ssl_mode,
                    "pool opened"
                );
                Ok(handle)
            }
            Ok(Err(source)) => {
                warn!(
                    backend = %kind,
                    host = %target.host,
                    port = target.port,
                    error = %source,
                    "pool creation failed"
                );
                Err(AcquireError::PoolCreation {
                    backend: kind.as_str(),
                    host: target.host.clone(),
                    port: target.port,
                    source,
                })
            }
            Err(_) => Err(AcquireError::Timeout {
                stage: Stage::Create,
                host: target.host.clone(),
                port: target.port,
                after: timeout,
            }),
        }
    }

    async fn acquire(
        &self,
        id: &str,
        target: &BackendTarget,
        timeout: Duration,
    ) -> AcquireResult<B::Handle> {
        if self.is_shutting_down() {
            return Err(AcquireError::ShuttingDown);
        }
        let deadline = Instant::now() + timeout;

        if id.is_empty() {
            debug!(host = %target.host, port = target.port, "opening ephemeral pool");
            return self.open_pool(target, deadline, timeout).await;
        }

        let created = tokio::time::timeout_at(
            deadline,
            self.registry
                .get_or_create(id, || self.open_pool(target, deadline, timeout)),
        )
        .await;

        let handle = match created {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    %id,
                    host = %target.host,
                    port = target.port,
                    ?timeout,
                    "gave up waiting for pool"
                );
                return Err(AcquireError::Timeout {
                    stage: Stage::Wait,
                    host: target.host.clone(),
                    port: target.port,
                    after: timeout,
                });
            }
        };

        // Shutdown may have started while this pool was being created.
        if self.is_shutting_down() {
            if let Some(orphan) = self.registry.evict(id).await {
                if let Err(err) = close_handle(&*self.backend, id, orphan).await {
                    warn!(error = %err, "closing pool created during shutdown failed");
                }
            }
            return Err(AcquireError::ShuttingDown);
        }

        Ok(handle)
    }

    /// Refuse new acquisitions, stop the reaper, then close every cached pool
    /// and wait for the closes to finish.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("engine already shutting down");
        }
        self.stop_reaper().await;

        let drained = self.registry.drain().await;
        info!(backend = %self.backend.kind(), pools = drained.len(), "draining pools");

        let mut closes = JoinSet::new();
        for entry in drained {
            let backend = Arc::clone(&self.backend);
            closes.spawn(async move { close_handle(&*backend, &entry.id, entry.handle).await });
        }

        let mut report = ShutdownReport::default();
        while let Some(joined) = closes.join_next().await {
            match joined {
                Ok(Ok(())) => report.closed += 1,
                Ok(Err(err)) => {
                    warn!(error = %err, "close during shutdown failed");
                    report.failed += 1;
                }
                Err(err) => {
                    warn!(error = %err, "close task panicked");
                    report.failed += 1;
                }
            }
        }

        info!(
            backend = %self.backend.kind(),
            closed = report.closed,
            failed = report.failed,
            "engine shut down"
        );
        report
    }

    /// Per-entry summaries, sorted by identifier.
    pub async fn stats(&self) -> Vec<EntryInfo> {
        self.registry.snapshot().await
    }

    /// Log current pool statistics.
    pub async fn log_stats(&self) {
        let entries = self.stats().await;
        info!(backend = %self.backend.kind(), pools = entries.len(), "connection registry stats");
        for entry in &entries {
            info!(
                id = %entry.id,
                hits = entry.hits,
                idle_secs = entry.idle.as_secs(),
                age_secs = entry.age.as_secs(),
                "  pool"
            );
        }
    }
}

impl<B: PoolBackend> ConnectionEngine for Engine<B> {
    type Handle = B::Handle;

    async fn acquire_connection(
        &self,
        id: &str,
        target: &BackendTarget,
        timeout: Duration,
    ) -> AcquireResult<B::Handle> {
        self.acquire(id, target, timeout).await
    }

    async fn release_idle_connections(&self) -> SweepReport {
        self.reaper().sweep().await
    }
}

impl<B: PoolBackend> std::fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.backend.kind())
            .field("config", &self.config)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}
