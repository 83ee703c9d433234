//! Reconciliation of outgoing connections against the remote identity record.
//!
//! Before offering a peer a fresh key pair, the coordinator checks whether
//! the remote service already holds a key this wallet issued to that peer.
//! Recognition works through the issued-key ledger, a per-wallet document
//! mapping peer ids to the pairs handed to them.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::allocator::KeyPairSource;
use crate::errors::{CoreError, ReconcileError, StoreError};
use crate::queue::{Dispatched, OfflineQueue};
use crate::store::{DocumentStore, SaveOptions};
use crate::types::{KeyPair, RemoteIdentityRecord};

/// Document id of a wallet's issued-key ledger.
pub fn ledger_document_id(wallet_id: &str) -> String {
    format!("connection_identity_keys:{}", wallet_id)
}

// ============================================================================
// Issued-Key Ledger
// ============================================================================

/// Key pairs this wallet has issued, keyed by peer id.
///
/// Writes hold a lock shared by all clones of the ledger and replace the
/// whole map with a forced save. Use one ledger (or its clones) per wallet.
#[derive(Clone)]
pub struct IssuedKeyLedger {
    store: DocumentStore,
    doc_id: String,
    write_lock: Arc<Mutex<()>>,
}

impl IssuedKeyLedger {
    pub fn new(store: DocumentStore, wallet_id: &str) -> Self {
        Self {
            store,
            doc_id: ledger_document_id(wallet_id),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn entries(&self) -> Result<BTreeMap<String, Vec<KeyPair>>, StoreError> {
        Ok(self.store.load(&self.doc_id).await?.unwrap_or_default())
    }

    /// Pairs issued to one peer, oldest first.
    pub async fn issued_to(&self, peer_id: &str) -> Result<Vec<KeyPair>, StoreError> {
        Ok(self.entries().await?.remove(peer_id).unwrap_or_default())
    }

    /// First remote record for `peer_id` whose keys this wallet issued.
    pub async fn recognize(
        &self,
        peer_id: &str,
        records: &[RemoteIdentityRecord],
    ) -> Result<Option<KeyPair>, StoreError> {
        let entries = self.entries().await?;
        let found = records
            .iter()
            .filter(|r| r.peer_id == peer_id)
            .find_map(|r| {
                entries
                    .values()
                    .flatten()
                    .find(|p| p.matches(&r.identity_public_key, &r.derived_public_key))
            })
            .cloned();
        Ok(found)
    }

    /// Record `pair` as issued to `peer_id`.
    pub async fn record(&self, peer_id: &str, pair: &KeyPair) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.entries().await?;
        let issued = entries.entry(peer_id.to_string()).or_default();
        if issued.iter().any(|p| p.connection_index == pair.connection_index) {
            return Ok(());
        }
        issued.push(pair.clone());
        self.save_entries(&entries).await
    }

    /// Drop `pair` from what was issued to `peer_id`.
    pub async fn forget(&self, peer_id: &str, pair: &KeyPair) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.entries().await?;
        let Some(issued) = entries.get_mut(peer_id) else {
            return Ok(());
        };
        let before = issued.len();
        issued.retain(|p| p.connection_index != pair.connection_index);
        if issued.len() == before {
            return Ok(());
        }
        if issued.is_empty() {
            entries.remove(peer_id);
        }
        self.save_entries(&entries).await
    }

    async fn save_entries(
        &self,
        entries: &BTreeMap<String, Vec<KeyPair>>,
    ) -> Result<(), StoreError> {
        self.store
            .store(&self.doc_id, entries, SaveOptions::forced())
            .await?;
        Ok(())
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Key pair chosen for a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub key_pair: KeyPair,
    /// The pair was already on record for this peer; the pool was not touched.
    pub reused: bool,
}

/// Picks the identity key pair to offer a peer.
#[derive(Clone)]
pub struct ReconciliationCoordinator {
    pool: Arc<dyn KeyPairSource>,
    ledger: IssuedKeyLedger,
}

impl ReconciliationCoordinator {
    pub fn new(pool: Arc<dyn KeyPairSource>, ledger: IssuedKeyLedger) -> Self {
        Self { pool, ledger }
    }

    pub fn ledger(&self) -> &IssuedKeyLedger {
        &self.ledger
    }

    /// Reuse a key already on record for `peer_id`, or reserve a new one.
    pub async fn resolve_for_peer(
        &self,
        peer_id: &str,
        remote_records: &[RemoteIdentityRecord],
    ) -> Result<Resolution, ReconcileError> {
        if let Some(key_pair) = self.ledger.recognize(peer_id, remote_records).await? {
            debug!(
                peer = peer_id,
                connection_index = key_pair.connection_index,
                "reusing issued key"
            );
            return Ok(Resolution {
                key_pair,
                reused: true,
            });
        }

        let key_pair = self
            .pool
            .reserve(1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ReconcileError::AllocationExhausted {
                peer_id: peer_id.to_string(),
            })?;

        self.ledger.record(peer_id, &key_pair).await?;
        info!(
            peer = peer_id,
            connection_index = key_pair.connection_index,
            "issued new connection key"
        );
        Ok(Resolution {
            key_pair,
            reused: false,
        })
    }

    /// Fetch, resolve and publish the key pair for `peer_id`.
    ///
    /// A fresh pair is published through the queue and may be deferred while
    /// offline. If the service rejects it, the pair goes back to the pool.
    pub async fn establish(
        &self,
        peer_id: &str,
        queue: &OfflineQueue,
    ) -> Result<Resolution, CoreError> {
        let records = queue.fetch_identity_records(peer_id).await?;
        let resolution = self.resolve_for_peer(peer_id, &records).await?;
        if resolution.reused {
            return Ok(resolution);
        }

        match queue
            .publish_identity_key(peer_id, &resolution.key_pair)
            .await
        {
            Ok(Dispatched::Completed(_)) => {
                debug!(peer = peer_id, "identity key published");
                Ok(resolution)
            }
            Ok(Dispatched::Queued { seq }) => {
                info!(peer = peer_id, seq, "identity key publish deferred");
                Ok(resolution)
            }
            Err(e) => {
                warn!(peer = peer_id, error = %e, "publish failed, returning key to pool");
                self.ledger
                    .forget(peer_id, &resolution.key_pair)
                    .await
                    .map_err(ReconcileError::from)?;
                self.pool
                    .release(vec![resolution.key_pair])
                    .await
                    .map_err(ReconcileError::from)?;
                Err(e)
            }
        }
    }
}
