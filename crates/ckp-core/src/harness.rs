//! Test harness for the connection key pool.
//!
//! Scriptable fakes for the remote identity service, key derivation and
//! storage, plus a `TestWallet` that wires an allocator over them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use getrandom::getrandom;
use parking_lot::Mutex;
use serde_json::Value;

use ckp_crypto::derive::DeriveError;
use ckp_crypto::seed::WalletSeed;

use crate::allocator::{pool_document_id, PoolAllocator};
use crate::config::PoolConfig;
use crate::errors::ServiceError;
use crate::keys::{KeyDeriver, SeedDeriver};
use crate::queue::{PublishAck, QueuedCall, RemoteIdentityService};
use crate::store::{Document, DocumentBackend, DocumentStore, InMemoryStore, Revision, StoreError};
use crate::types::{KeyPair, PoolState, RemoteIdentityRecord};

/// Generate a random 32-byte array.
pub fn rand32() -> [u8; 32] {
    let mut b = [0u8; 32];
    getrandom(&mut b).expect("rng");
    b
}

/// Seed shared by tests that want reproducible keys.
pub fn test_seed() -> Arc<WalletSeed> {
    Arc::new(WalletSeed::from_bytes([0x5A; 32]))
}

/// Deriver over [`test_seed`].
pub fn test_deriver() -> Arc<dyn KeyDeriver> {
    Arc::new(SeedDeriver::new(test_seed()))
}

// ============================================================================
// Identity Service
// ============================================================================

/// In-process identity service that records every call.
///
/// Failures pushed with [`push_failure`](Self::push_failure) are returned by
/// the next calls, one each, before normal behavior resumes. Published keys
/// become records returned by later fetches.
#[derive(Default)]
pub struct ScriptedIdentityService {
    calls: Mutex<Vec<QueuedCall>>,
    failures: Mutex<VecDeque<ServiceError>>,
    publish_failures: Mutex<VecDeque<ServiceError>>,
    records: Mutex<HashMap<String, Vec<RemoteIdentityRecord>>>,
    latency: Option<Duration>,
}

impl ScriptedIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn push_failure(&self, error: ServiceError) {
        self.failures.lock().push_back(error);
    }

    /// Fail the next publish call only; fetches are unaffected.
    pub fn push_publish_failure(&self, error: ServiceError) {
        self.publish_failures.lock().push_back(error);
    }

    pub fn add_record(&self, record: RemoteIdentityRecord) {
        self.records
            .lock()
            .entry(record.peer_id.clone())
            .or_default()
            .push(record);
    }

    /// Every call received so far, in arrival order.
    pub fn calls(&self) -> Vec<QueuedCall> {
        self.calls.lock().clone()
    }

    /// Peer ids of the publish calls received so far.
    pub fn published_peers(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, QueuedCall::PublishIdentityKey { .. }))
            .map(|c| c.peer_id().to_string())
            .collect()
    }

    async fn enter(&self, call: QueuedCall) -> Result<(), ServiceError> {
        let is_publish = matches!(call, QueuedCall::PublishIdentityKey { .. });
        self.calls.lock().push(call);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if is_publish {
            if let Some(e) = self.publish_failures.lock().pop_front() {
                return Err(e);
            }
        }
        match self.failures.lock().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteIdentityService for ScriptedIdentityService {
    async fn fetch_identity_records(
        &self,
        peer_id: &str,
    ) -> Result<Vec<RemoteIdentityRecord>, ServiceError> {
        self.enter(QueuedCall::FetchIdentityRecords {
            peer_id: peer_id.to_string(),
        })
        .await?;
        Ok(self.records.lock().get(peer_id).cloned().unwrap_or_default())
    }

    async fn publish_identity_key(
        &self,
        peer_id: &str,
        identity_public_key: &[u8; 32],
        derived_public_key: &[u8; 32],
    ) -> Result<PublishAck, ServiceError> {
        self.enter(QueuedCall::PublishIdentityKey {
            peer_id: peer_id.to_string(),
            identity_public_key: *identity_public_key,
            derived_public_key: *derived_public_key,
        })
        .await?;
        self.add_record(RemoteIdentityRecord {
            peer_id: peer_id.to_string(),
            identity_public_key: *identity_public_key,
            derived_public_key: *derived_public_key,
        });
        Ok(PublishAck {
            peer_id: peer_id.to_string(),
        })
    }
}

// ============================================================================
// Key Derivation
// ============================================================================

/// Deriver that fails or panics at chosen indices.
pub struct FlakyDeriver {
    inner: SeedDeriver,
    fail_at: HashSet<u64>,
    panic_at: HashSet<u64>,
    derived: AtomicUsize,
}

impl FlakyDeriver {
    pub fn failing_at(indices: impl IntoIterator<Item = u64>) -> Self {
        Self {
            inner: SeedDeriver::new(test_seed()),
            fail_at: indices.into_iter().collect(),
            panic_at: HashSet::new(),
            derived: AtomicUsize::new(0),
        }
    }

    pub fn panicking_at(indices: impl IntoIterator<Item = u64>) -> Self {
        Self {
            inner: SeedDeriver::new(test_seed()),
            fail_at: HashSet::new(),
            panic_at: indices.into_iter().collect(),
            derived: AtomicUsize::new(0),
        }
    }

    /// Successful derivations so far.
    pub fn derived(&self) -> usize {
        self.derived.load(Ordering::SeqCst)
    }
}

impl KeyDeriver for FlakyDeriver {
    fn derive_key_pair(&self, connection_index: u64) -> Result<KeyPair, DeriveError> {
        if self.panic_at.contains(&connection_index) {
            panic!("injected panic at connection index {}", connection_index);
        }
        if self.fail_at.contains(&connection_index) {
            return Err(DeriveError::Unavailable(format!(
                "injected failure at {}",
                connection_index
            )));
        }
        let pair = self.inner.derive_key_pair(connection_index)?;
        self.derived.fetch_add(1, Ordering::SeqCst);
        Ok(pair)
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Document backend whose writes can be switched off.
pub struct SwitchableBackend {
    inner: InMemoryStore,
    writable: AtomicBool,
}

impl SwitchableBackend {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            writable: AtomicBool::new(true),
        }
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.writable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::OperationFailed("store is read-only".to_string()))
        }
    }
}

#[async_trait]
impl DocumentBackend for SwitchableBackend {
    async fn load(&self, id: &str) -> Result<Option<Document>, StoreError> {
        self.inner.load(id).await
    }

    async fn write(
        &self,
        id: &str,
        body: Value,
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError> {
        self.check()?;
        self.inner.write(id, body, expected).await
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        self.check()?;
        DocumentBackend::remove(&self.inner, id).await
    }
}

// ============================================================================
// Wallet Fixture
// ============================================================================

/// A wallet id, store and deriver ready to spawn allocators over.
pub struct TestWallet {
    pub wallet_id: String,
    pub store: DocumentStore,
    pub deriver: Arc<dyn KeyDeriver>,
    pub config: PoolConfig,
}

impl TestWallet {
    /// Default pool sizing over a fresh in-memory store.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Self::with_deriver(config, test_deriver())
    }

    pub fn with_deriver(config: PoolConfig, deriver: Arc<dyn KeyDeriver>) -> Self {
        Self::build(config, deriver, InMemoryStore::new_shared())
    }

    pub fn with_backend(config: PoolConfig, backend: Arc<dyn DocumentBackend>) -> Self {
        Self::build(config, test_deriver(), backend)
    }

    fn build(
        config: PoolConfig,
        deriver: Arc<dyn KeyDeriver>,
        backend: Arc<dyn DocumentBackend>,
    ) -> Self {
        Self {
            wallet_id: hex::encode(rand32()),
            store: DocumentStore::new(backend),
            deriver,
            config,
        }
    }

    /// Spawn an allocator for this wallet.
    pub fn allocator(&self) -> PoolAllocator {
        PoolAllocator::spawn(
            self.wallet_id.clone(),
            self.store.clone(),
            self.deriver.clone(),
            &self.config,
        )
    }

    /// Pool state as persisted, bypassing any allocator.
    pub async fn pool_state(&self) -> PoolState {
        self.store
            .load(&pool_document_id(&self.wallet_id))
            .await
            .expect("load pool state")
            .unwrap_or_default()
    }
}

impl Default for TestWallet {
    fn default() -> Self {
        Self::new()
    }
}
