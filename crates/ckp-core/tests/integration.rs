//! Integration tests for the connection key pool.
//!
//! These tests verify allocation bookkeeping, ordered offline replay and
//! reconciliation across the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ckp_core::{
    config::PoolConfig,
    errors::{CoreError, PoolError, ServiceError},
    harness::{ScriptedIdentityService, TestWallet},
    queue::{Dispatched, QueuedCall},
    reconcile::ledger_document_id,
    retry::RetryPolicy,
    store::InMemoryStore,
    IssuedKeyLedger, KeyPair, KeyPairSource, NetworkMonitor, NetworkStatus, OfflineQueue,
    PoolAllocator, ReconciliationCoordinator,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Pool config without automatic background top-up.
fn manual_pool(target_size: usize) -> PoolConfig {
    PoolConfig {
        target_size,
        low_water_mark: 0,
        generator_workers: 3,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        retries: 2,
        min_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        factor: 2.0,
    }
}

fn indices(pairs: &[KeyPair]) -> Vec<u64> {
    pairs.iter().map(|p| p.connection_index).collect()
}

/// Counts reservations made through it.
struct CountingSource {
    inner: PoolAllocator,
    reserves: AtomicUsize,
}

#[async_trait]
impl KeyPairSource for CountingSource {
    async fn reserve(&self, count: usize) -> Result<Vec<KeyPair>, PoolError> {
        self.reserves.fetch_add(1, Ordering::SeqCst);
        self.inner.reserve(count).await
    }

    async fn release(&self, pairs: Vec<KeyPair>) -> Result<usize, PoolError> {
        self.inner.release(pairs).await
    }
}

// ============================================================================
// Allocation
// ============================================================================

/// Test: Reservations are strictly increasing and never repeat across calls
#[tokio::test]
async fn integration_reservations_unique_and_ordered() {
    init_tracing();
    let wallet = TestWallet::with_config(PoolConfig {
        target_size: 8,
        low_water_mark: 4,
        generator_workers: 2,
    });
    let pool = wallet.allocator();

    let mut seen = Vec::new();
    for n in [1, 5, 3, 9, 2, 7] {
        let pairs = pool.reserve(n).await.unwrap();
        assert_eq!(pairs.len(), n);
        let idx = indices(&pairs);
        assert!(idx.windows(2).all(|w| w[0] < w[1]), "not increasing: {:?}", idx);
        seen.extend(idx);
    }

    let total = seen.len();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), total, "a key pair was handed out twice");
}

/// Test: Short pool is emptied and the watermark moves by the generated count
#[tokio::test]
async fn integration_reserve_beyond_pool() {
    init_tracing();
    let wallet = TestWallet::with_config(manual_pool(10));
    let pool = wallet.allocator();
    assert!(pool.replenish().await.unwrap());
    pool.wait_idle().await.unwrap();

    let before = pool.snapshot().await.unwrap();
    assert_eq!(before.entries.len(), 10);
    assert_eq!(before.last_connection_key_index, Some(9));

    let pairs = pool.reserve(15).await.unwrap();
    assert_eq!(indices(&pairs), (0..15).collect::<Vec<_>>());

    let after = wallet.pool_state().await;
    assert!(after.entries.is_empty());
    assert_eq!(after.last_connection_key_index, Some(9 + 5));
}

/// Test: Covered reservation takes the lowest entries and leaves the watermark
#[tokio::test]
async fn integration_reserve_within_pool() {
    init_tracing();
    let wallet = TestWallet::with_config(manual_pool(10));
    let pool = wallet.allocator();
    pool.replenish().await.unwrap();
    pool.wait_idle().await.unwrap();

    let before = wallet.pool_state().await;
    let pairs = pool.reserve(4).await.unwrap();
    let after = wallet.pool_state().await;

    assert_eq!(pairs, before.entries[..4].to_vec());
    assert_eq!(after.entries, before.entries[4..].to_vec());
    assert_eq!(after.last_connection_key_index, before.last_connection_key_index);
}

/// Test: Reservation blocked on persistence hands out nothing
#[tokio::test]
async fn integration_persist_before_handoff() {
    init_tracing();
    let backend = Arc::new(ckp_core::harness::SwitchableBackend::new(InMemoryStore::new()));
    let wallet = TestWallet::with_backend(manual_pool(10), backend.clone());
    let pool = wallet.allocator();

    backend.set_writable(false);
    assert!(pool.reserve(3).await.is_err());
    backend.set_writable(true);

    assert_eq!(indices(&pool.reserve(3).await.unwrap()), vec![0, 1, 2]);
}

// ============================================================================
// Offline Queue
// ============================================================================

/// Test: Items queued offline replay in order ahead of a call made after reconnect
#[tokio::test(start_paused = true)]
async fn integration_offline_replay_order() {
    init_tracing();
    let monitor = NetworkMonitor::new(NetworkStatus::Offline);
    let service = Arc::new(ScriptedIdentityService::with_latency(Duration::from_millis(50)));
    let queue = OfflineQueue::new(
        service.clone(),
        InMemoryStore::new_shared(),
        monitor.subscribe(),
        fast_retry(),
    );
    let drainer = queue.spawn_reconnect_drain();

    let wallet = TestWallet::new();
    let pool = wallet.allocator();
    let pairs = pool.reserve(4).await.unwrap();

    for (peer, pair) in ["a", "b", "c"].iter().zip(&pairs) {
        let queued = queue.publish_identity_key(peer, pair).await.unwrap();
        assert!(matches!(queued, Dispatched::Queued { .. }));
    }
    assert!(service.calls().is_empty());

    monitor.set(NetworkStatus::Online);
    tokio::task::yield_now().await;
    let d = queue.publish_identity_key("d", &pairs[3]).await.unwrap();
    assert!(matches!(d, Dispatched::Completed(_)));

    assert_eq!(service.published_peers(), vec!["a", "b", "c", "d"]);
    assert_eq!(queue.pending_len().await.unwrap(), 0);
    drainer.abort();
}

/// Test: Going offline again does not replay anything
#[tokio::test(start_paused = true)]
async fn integration_offline_transition_is_inert() {
    init_tracing();
    let monitor = NetworkMonitor::new(NetworkStatus::Online);
    let service = Arc::new(ScriptedIdentityService::new());
    let queue = OfflineQueue::new(
        service.clone(),
        InMemoryStore::new_shared(),
        monitor.subscribe(),
        fast_retry(),
    );
    let drainer = queue.spawn_reconnect_drain();

    monitor.set(NetworkStatus::Offline);
    let call = QueuedCall::FetchIdentityRecords {
        peer_id: "x".into(),
    };
    queue.dispatch(call, true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(service.calls().is_empty());
    assert_eq!(queue.pending_len().await.unwrap(), 1);
    drainer.abort();
}

/// Test: Queue contents outlive the queue instance
#[tokio::test(start_paused = true)]
async fn integration_queue_survives_restart() {
    init_tracing();
    let store = InMemoryStore::new_shared();
    let service = Arc::new(ScriptedIdentityService::new());

    let offline = NetworkMonitor::new(NetworkStatus::Offline);
    let first = OfflineQueue::new(service.clone(), store.clone(), offline.subscribe(), fast_retry());
    let wallet = TestWallet::new();
    let pairs = wallet.allocator().reserve(2).await.unwrap();
    first.publish_identity_key("a", &pairs[0]).await.unwrap();
    first.publish_identity_key("b", &pairs[1]).await.unwrap();
    drop(first);

    let online = NetworkMonitor::new(NetworkStatus::Online);
    let second = OfflineQueue::new(service.clone(), store, online.subscribe(), fast_retry());
    let drainer = second.spawn_reconnect_drain();
    for _ in 0..50 {
        if second.pending_len().await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(service.published_peers(), vec!["a", "b"]);
    drainer.abort();
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Test: A known key on record is reused without touching the pool
#[tokio::test]
async fn integration_reconcile_reuses_issued_key() {
    init_tracing();
    let wallet = TestWallet::with_config(manual_pool(10));
    let source = Arc::new(CountingSource {
        inner: wallet.allocator(),
        reserves: AtomicUsize::new(0),
    });
    let ledger = IssuedKeyLedger::new(wallet.store.clone(), &wallet.wallet_id);
    let coordinator = ReconciliationCoordinator::new(source.clone(), ledger);

    let monitor = NetworkMonitor::new(NetworkStatus::Online);
    let service = Arc::new(ScriptedIdentityService::new());
    let queue = OfflineQueue::new(
        service.clone(),
        InMemoryStore::new_shared(),
        monitor.subscribe(),
        fast_retry(),
    );

    let first = coordinator.establish("alice", &queue).await.unwrap();
    assert!(!first.reused);
    assert_eq!(source.reserves.load(Ordering::SeqCst), 1);

    let second = coordinator.establish("alice", &queue).await.unwrap();
    assert!(second.reused);
    assert_eq!(second.key_pair, first.key_pair);
    assert_eq!(source.reserves.load(Ordering::SeqCst), 1);

    let ledger_doc = wallet.store.get(&ledger_document_id(&wallet.wallet_id)).await.unwrap();
    assert!(ledger_doc.body.get("alice").is_some());
}

/// Test: A rejected publish returns the key pair to the pool
#[tokio::test]
async fn integration_rejected_publish_releases_key() {
    init_tracing();
    let wallet = TestWallet::with_config(manual_pool(10));
    let pool = wallet.allocator();
    let coordinator = ReconciliationCoordinator::new(
        Arc::new(pool.clone()),
        IssuedKeyLedger::new(wallet.store.clone(), &wallet.wallet_id),
    );

    let monitor = NetworkMonitor::new(NetworkStatus::Online);
    let service = Arc::new(ScriptedIdentityService::new());
    service.push_publish_failure(ServiceError::Rejected {
        status: 403,
        message: "not allowed".into(),
    });
    let queue = OfflineQueue::new(
        service.clone(),
        InMemoryStore::new_shared(),
        monitor.subscribe(),
        fast_retry(),
    );

    let err = coordinator.establish("mallory", &queue).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Service(ServiceError::Rejected { status: 403, .. })
    ));
    assert!(err.is_terminal());

    let state = pool.snapshot().await.unwrap();
    assert_eq!(indices(&state.entries), vec![0]);
    assert!(coordinator.ledger().issued_to("mallory").await.unwrap().is_empty());

    // The released pair is the next one handed out.
    assert_eq!(indices(&pool.reserve(1).await.unwrap()), vec![0]);
}

/// Test: Offline establishment fails fast instead of guessing
#[tokio::test]
async fn integration_establish_offline_needs_records() {
    init_tracing();
    let wallet = TestWallet::with_config(manual_pool(10));
    let coordinator = ReconciliationCoordinator::new(
        Arc::new(wallet.allocator()),
        IssuedKeyLedger::new(wallet.store.clone(), &wallet.wallet_id),
    );
    let monitor = NetworkMonitor::new(NetworkStatus::Offline);
    let queue = OfflineQueue::new(
        Arc::new(ScriptedIdentityService::new()),
        InMemoryStore::new_shared(),
        monitor.subscribe(),
        fast_retry(),
    );

    let err = coordinator.establish("alice", &queue).await.unwrap_err();
    assert_eq!(err, CoreError::Service(ServiceError::Offline));
    assert_eq!(wallet.pool_state().await.last_connection_key_index, None);
}
