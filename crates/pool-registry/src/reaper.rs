//! Idle reclamation: evicts unused pools and closes them in the background.
//!
//! A sweep asks the registry for every entry idle longer than the threshold,
//! then spawns one close task per evicted handle. Closing never blocks the
//! sweep or the registry. A failing close is logged and the rest proceed.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::PoolBackend;
use crate::error::CloseError;
use crate::registry::ConnectionRegistry;

/// Shortest period [`Reaper::spawn`] will tick at.
pub const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// One evicted entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictedEntry {
    pub id: String,
    pub idle: Duration,
}

/// Outcome of a single sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<EvictedEntry>,
}

impl SweepReport {
    pub fn evicted_count(&self) -> usize {
        self.evicted.len()
    }

    pub fn evicted_ids(&self) -> Vec<&str> {
        self.evicted.iter().map(|e| e.id.as_str()).collect()
    }
}

/// Close `handle`, attributing any failure to `id`.
pub(crate) async fn close_handle<B: PoolBackend>(
    backend: &B,
    id: &str,
    handle: B::Handle,
) -> Result<(), CloseError> {
    backend.close(handle).await.map_err(|source| CloseError {
        backend: backend.kind().as_str(),
        id: id.to_string(),
        source,
    })
}

/// Close `handle` on a background task. Failures are logged, not retried.
fn close_detached<B: PoolBackend>(backend: Arc<B>, id: String, handle: B::Handle) {
    tokio::spawn(async move {
        match close_handle(&*backend, &id, handle).await {
            Ok(()) => debug!(%id, "closed evicted pool"),
            Err(err) => warn!(error = %err, "closing evicted pool failed"),
        }
    });
}

/// Sweeps one registry for idle entries.
pub struct Reaper<B: PoolBackend> {
    backend: Arc<B>,
    registry: Arc<ConnectionRegistry<B::Handle>>,
    idle_threshold: Duration,
}

impl<B: PoolBackend> Reaper<B> {
    pub fn new(
        backend: Arc<B>,
        registry: Arc<ConnectionRegistry<B::Handle>>,
        idle_threshold: Duration,
    ) -> Self {
        Self {
            backend,
            registry,
            idle_threshold,
        }
    }

    /// Evict every entry idle longer than the threshold and schedule its
    /// close. Returns once eviction is done; closes may still be running.
    pub async fn sweep(&self) -> SweepReport {
        let evicted = self.registry.evict_idle(self.idle_threshold).await;
        let mut report = SweepReport::default();

        for entry in evicted {
            info!(
                id = %entry.id,
                backend = %self.backend.kind(),
                idle_secs = entry.idle.as_secs(),
                "evicting idle pool"
            );
            report.evicted.push(EvictedEntry {
                id: entry.id.clone(),
                idle: entry.idle,
            });
            close_detached(Arc::clone(&self.backend), entry.id, entry.handle);
        }

        if !report.evicted.is_empty() {
            info!(
                backend = %self.backend.kind(),
                evicted = report.evicted_count(),
                "idle sweep complete"
            );
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `interval` on a background task.
    ///
    /// The task holds only a weak reference to the registry and exits once
    /// the registry is dropped, when [`ReaperHandle::shutdown`] is called,
    /// or when the handle itself is dropped.
    ///
    /// Intervals below [`MIN_REAP_INTERVAL`] are raised to it.
    pub fn spawn(self, interval: Duration) -> ReaperHandle {
        if interval < MIN_REAP_INTERVAL {
            warn!(?interval, min = ?MIN_REAP_INTERVAL, "reap interval too short, clamping");
        }
        let interval = interval.max(MIN_REAP_INTERVAL);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::downgrade(&self.registry);
        let backend = self.backend;
        let idle_threshold = self.idle_threshold;

        let handle = tokio::spawn(run_reaper_loop(
            backend,
            registry,
            idle_threshold,
            interval,
            shutdown_rx,
        ));

        info!(?interval, ?idle_threshold, "idle reaper started");
        ReaperHandle {
            shutdown_tx,
            handle,
        }
    }
}

async fn run_reaper_loop<B: PoolBackend>(
    backend: Arc<B>,
    registry: Weak<ConnectionRegistry<B::Handle>>,
    idle_threshold: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing can be idle yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(registry) = registry.upgrade() else {
                    debug!("registry dropped, reaper exiting");
                    break;
                };
                Reaper::new(Arc::clone(&backend), registry, idle_threshold)
                    .sweep()
                    .await;
            }
            _ = shutdown.changed() => {
                debug!("reaper shutting down");
                break;
            }
        }
    }
}

/// Control handle for a running reaper task.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the task and wait for it to exit. An in-progress sweep finishes
    /// first; closes it spawned keep running.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "reaper task ended abnormally");
        }
        info!("idle reaper stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
