//! Engine integration tests against a mock backend.
//!
//! The probe dials real loopback sockets: a bound `TcpListener` is a
//! reachable host, a listener that was bound and dropped is an unreachable
//! one. Pool creation goes through `MockBackend`, which counts opens and
//! closes and can be slowed down or made to fail.

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;

use pool_registry::{
    AcquireError, BackendKind, BackendTarget, BoxError, ConnectionDescriptor, ConnectionEngine,
    Engine, PoolBackend, RegistryConfig, SslMode, Stage,
};

// ── Tracing setup ────────────────────────────────────────────────

static TRACING_INIT: Once = Once::new();

/// Controlled by `RUST_LOG` (e.g. `RUST_LOG=pool_registry=debug`).
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── MockBackend ──────────────────────────────────────────────────

#[derive(Debug)]
struct MockPool {
    serial: u64,
    descriptor: ConnectionDescriptor,
}

type MockHandle = Arc<MockPool>;

#[derive(Default)]
struct MockBackend {
    opened: AtomicU64,
    closed: AtomicU64,
    latency: Duration,
    fail_open: AtomicBool,
    fail_close: bool,
}

impl MockBackend {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PoolBackend for MockBackend {
    type Handle = MockHandle;

    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<MockHandle, BoxError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err("password authentication failed for user \"app\"".into());
        }
        let serial = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(MockPool {
            serial,
            descriptor: descriptor.clone(),
        }))
    }

    async fn close(&self, _handle: MockHandle) -> Result<(), BoxError> {
        if self.fail_close {
            return Err("broken pipe".into());
        }
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Helpers ──────────────────────────────────────────────────────

const TIMEOUT: Duration = Duration::from_secs(5);

fn engine(backend: MockBackend) -> Engine<MockBackend> {
    init_tracing();
    Engine::new(backend, RegistryConfig::default()).expect("valid config")
}

async fn reachable() -> (TcpListener, BackendTarget) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let target = BackendTarget::new("127.0.0.1", port, "app", "app", "s3cret");
    (listener, target)
}

async fn unreachable() -> BackendTarget {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    BackendTarget::new("127.0.0.1", port, "app", "app", "s3cret")
}

// ── Caching ──────────────────────────────────────────────────────

#[tokio::test]
async fn first_acquire_creates_and_caches() {
    let engine = engine(MockBackend::default());
    let (_listener, target) = reachable().await;

    let handle = engine.acquire_connection("conn1", &target, TIMEOUT).await.unwrap();
    assert_eq!(handle.serial, 1);
    assert_eq!(engine.registry().ids().await, vec!["conn1".to_string()]);

    let entry = engine.registry().lookup("conn1").await.unwrap();
    assert!(Arc::ptr_eq(&entry.handle, &handle));
    assert!(entry.last_used.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn second_acquire_reuses_handle_without_probe_or_create() {
    let engine = engine(MockBackend::default());
    let (listener, target) = reachable().await;

    let first = engine.acquire_connection("conn1", &target, TIMEOUT).await.unwrap();
    let before = engine.registry().lookup("conn1").await.unwrap().last_used;

    // With the listener gone a probe would fail, so success proves the hit
    // path skips it.
    drop(listener);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = engine.acquire_connection("conn1", &target, TIMEOUT).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(engine.backend().opened(), 1);

    let entry = engine.registry().lookup("conn1").await.unwrap();
    assert!(entry.last_used > before);
    assert_eq!(entry.hits, 1);
}

#[tokio::test]
async fn distinct_ids_get_distinct_pools() {
    let engine = engine(MockBackend::default());
    let (_listener, target) = reachable().await;

    let a = engine.acquire_connection("a", &target, TIMEOUT).await.unwrap();
    let b = engine.acquire_connection("b", &target, TIMEOUT).await.unwrap();
    assert_ne!(a.serial, b.serial);
    assert_eq!(engine.registry().len().await, 2);
}

#[tokio::test]
async fn encryption_flag_selects_ssl_mode() {
    let engine = engine(MockBackend::default());
    let (_listener, target) = reachable().await;

    let plain = engine.acquire_connection("plain", &target, TIMEOUT).await.unwrap();
    assert_eq!(plain.descriptor.ssl_mode, SslMode::Prefer);

    let tls_target = target.clone().with_encryption(true);
    let tls = engine.acquire_connection("tls", &tls_target, TIMEOUT).await.unwrap();
    assert_eq!(tls.descriptor.ssl_mode, SslMode::Require);
    assert!(!tls.descriptor.to_string().contains("s3cret"));
}

// ── Failure paths ────────────────────────────────────────────────

#[tokio::test]
async fn unreachable_host_is_connectivity_error() {
    let engine = engine(MockBackend::default());
    let (_listener, good) = reachable().await;
    engine.acquire_connection("conn1", &good, TIMEOUT).await.unwrap();

    let bad = unreachable().await;
    let err = engine.acquire_connection("conn2", &bad, TIMEOUT).await.unwrap_err();
    assert!(err.is_connectivity(), "unexpected error: {err}");

    assert_eq!(engine.registry().ids().await, vec!["conn1".to_string()]);
    assert_eq!(engine.backend().opened(), 1);
}

#[tokio::test]
async fn failed_creation_leaves_no_entry_and_next_call_retries() {
    let backend = MockBackend::default();
    backend.fail_open.store(true, Ordering::SeqCst);
    let engine = engine(backend);
    let (_listener, target) = reachable().await;

    let err = engine.acquire_connection("conn1", &target, TIMEOUT).await.unwrap_err();
    match &err {
        AcquireError::PoolCreation { backend, port, .. } => {
            assert_eq!(*backend, "postgres");
            assert_eq!(*port, target.port);
        }
        other => panic!("expected PoolCreation, got {other}"),
    }
    assert!(engine.registry().is_empty().await);

    engine.backend().fail_open.store(false, Ordering::SeqCst);
    let handle = engine.acquire_connection("conn1", &target, TIMEOUT).await.unwrap();
    assert_eq!(handle.serial, 1);
    assert!(engine.registry().contains("conn1").await);
}

#[tokio::test]
async fn slow_creation_times_out_without_entry() {
    let engine = engine(MockBackend::with_latency(Duration::from_secs(5)));
    let (_listener, target) = reachable().await;

    let err = engine
        .acquire_connection("conn1", &target, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(
        matches!(err, AcquireError::Timeout { stage: Stage::Create, .. }),
        "unexpected error: {err}"
    );
    assert!(engine.registry().is_empty().await);
}

#[tokio::test]
async fn waiter_with_short_deadline_times_out_while_creator_succeeds() {
    let engine = Arc::new(engine(MockBackend::with_latency(Duration::from_millis(500))));
    let (_listener, target) = reachable().await;

    let creator = {
        let engine = Arc::clone(&engine);
        let target = target.clone();
        tokio::spawn(async move { engine.acquire_connection("conn1", &target, TIMEOUT).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = engine
        .acquire_connection("conn1", &target, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(
        matches!(err, AcquireError::Timeout { stage: Stage::Wait, .. }),
        "unexpected error: {err}"
    );

    let handle = creator.await.unwrap().unwrap();
    assert_eq!(handle.serial, 1);
    assert_eq!(engine.registry().len().await, 1);
}

// ── Ephemeral acquisitions ───────────────────────────────────────

#[tokio::test]
async fn empty_id_is_never_cached() {
    let engine = engine(MockBackend::default());
    let (_listener, target) = reachable().await;

    let a = engine.acquire_connection("", &target, TIMEOUT).await.unwrap();
    let b = engine.acquire_connection("", &target, TIMEOUT).await.unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(engine.backend().opened(), 2);
    assert!(engine.registry().is_empty().await);

    let bad = unreachable().await;
    assert!(engine.acquire_connection("", &bad, TIMEOUT).await.is_err());
    assert!(engine.registry().is_empty().await);
}

// ── Single-flight ────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_acquires_share_one_creation() {
    let engine = Arc::new(engine(MockBackend::with_latency(Duration::from_millis(500))));
    let (_listener, target) = reachable().await;

    let started = tokio::time::Instant::now();
    let (a, b) = tokio::join!(
        engine.acquire_connection("conn3", &target, TIMEOUT),
        engine.acquire_connection("conn3", &target, TIMEOUT),
    );
    let elapsed = started.elapsed();

    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(engine.backend().opened(), 1);
    assert!(elapsed >= Duration::from_millis(500), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_acquires_create_once() {
    let engine = Arc::new(engine(MockBackend::with_latency(Duration::from_millis(200))));
    let (_listener, target) = reachable().await;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let engine = Arc::clone(&engine);
        let target = target.clone();
        tasks.push(tokio::spawn(async move {
            engine.acquire_connection("shared", &target, TIMEOUT).await
        }));
    }

    let mut serials = Vec::new();
    for task in tasks {
        serials.push(task.await.unwrap().unwrap().serial);
    }
    assert!(serials.iter().all(|s| *s == 1), "serials: {serials:?}");
    assert_eq!(engine.backend().opened(), 1);
    assert_eq!(engine.registry().len().await, 1);
}

// ── Idle reclamation ─────────────────────────────────────────────

#[tokio::test]
async fn idle_pool_is_evicted_closed_and_recreated() {
    let engine = engine(MockBackend::default());
    let (_listener, target) = reachable().await;

    let first = engine.acquire_connection("conn1", &target, TIMEOUT).await.unwrap();

    tokio::time::pause();
    tokio::time::advance(Duration::from_secs(21 * 60)).await;
    let report = engine.release_idle_connections().await;
    assert_eq!(report.evicted_ids(), vec!["conn1"]);
    assert!(report.evicted[0].idle >= Duration::from_secs(21 * 60));
    assert!(engine.registry().is_empty().await);

    // Let the background close run, then go back to real time for the probe.
    tokio::time::sleep(Duration::from_millis(1)).await;
    tokio::time::resume();
    assert_eq!(engine.backend().closed(), 1);

    let second = engine.acquire_connection("conn1", &target, TIMEOUT).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.serial, 2);
}

#[tokio::test]
async fn recently_used_pool_survives_sweep() {
    let engine = engine(MockBackend::default());
    let (_listener, target) = reachable().await;
    engine.acquire_connection("conn1", &target, TIMEOUT).await.unwrap();

    tokio::time::pause();
    tokio::time::advance(Duration::from_secs(15 * 60)).await;
    engine.acquire_connection("conn1", &target, TIMEOUT).await.unwrap();
    tokio::time::advance(Duration::from_secs(15 * 60)).await;

    let report = engine.release_idle_connections().await;
    assert_eq!(report.evicted_count(), 0);
    assert!(engine.registry().contains("conn1").await);
}

#[tokio::test]
async fn background_reaper_evicts_idle_pools() {
    let engine = Engine::new(
        MockBackend::default(),
        RegistryConfig::default()
            .with_idle_threshold(Duration::from_millis(300))
            .with_reap_interval(Duration::from_millis(100)),
    )
    .unwrap();
    let (_listener, target) = reachable().await;

    engine.acquire_connection("conn1", &target, TIMEOUT).await.unwrap();
    assert!(engine.start_reaper().await);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(engine.registry().is_empty().await);
    assert_eq!(engine.backend().closed(), 1);

    engine.stop_reaper().await;
}

#[tokio::test]
async fn close_failures_are_not_fatal() {
    let engine = engine(MockBackend {
        fail_close: true,
        ..MockBackend::default()
    });
    let (_listener, target) = reachable().await;
    engine.acquire_connection("conn1", &target, TIMEOUT).await.unwrap();

    tokio::time::pause();
    tokio::time::advance(Duration::from_secs(21 * 60)).await;
    assert_eq!(engine.release_idle_connections().await.evicted_count(), 1);
    assert!(engine.registry().is_empty().await);
}

// ── Shutdown ─────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_closes_pools_and_rejects_new_acquires() {
    let engine = engine(MockBackend::default());
    let (_listener, target) = reachable().await;
    engine.acquire_connection("a", &target, TIMEOUT).await.unwrap();
    engine.acquire_connection("b", &target, TIMEOUT).await.unwrap();
    engine.start_reaper().await;

    let report = engine.shutdown().await;
    assert_eq!(report.closed, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(engine.backend().closed(), 2);
    assert!(engine.registry().is_empty().await);

    let err = engine.acquire_connection("a", &target, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, AcquireError::ShuttingDown));
    assert!(engine.is_shutting_down());
}

#[tokio::test]
async fn shutdown_reports_failed_closes() {
    let engine = engine(MockBackend {
        fail_close: true,
        ..MockBackend::default()
    });
    let (_listener, target) = reachable().await;
    engine.acquire_connection("a", &target, TIMEOUT).await.unwrap();

    let report = engine.shutdown().await;
    assert_eq!(report.closed, 0);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn creation_racing_shutdown_is_rejected_and_closed() {
    let engine = Arc::new(engine(MockBackend::with_latency(Duration::from_millis(300))));
    let (_listener, target) = reachable().await;

    let pending = {
        let engine = Arc::clone(&engine);
        let target = target.clone();
        tokio::spawn(async move { engine.acquire_connection("late", &target, TIMEOUT).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = engine.shutdown().await;
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, AcquireError::ShuttingDown), "unexpected error: {err}");

    assert!(engine.registry().is_empty().await);
    assert_eq!(report.closed, 1);
    assert_eq!(engine.backend().opened(), 1);
    assert_eq!(engine.backend().closed(), 1);
}
