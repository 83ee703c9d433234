//! Offline dispatch queue for remote identity-service calls.
//!
//! Calls tagged `queue_if_offline` are persisted while the device is offline
//! and replayed strictly in order, one at a time, once connectivity returns.
//! A call issued online while older items are still waiting goes to the back
//! of the queue rather than overtaking them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::{CoreError, ResponseAware, ServiceError};
use crate::retry::{retry_on_network_error, RetryPolicy};
use crate::store::{QueueStore, Seq};
use crate::types::{KeyPair, NetworkStatus, RemoteIdentityRecord};

// ============================================================================
// Remote Service
// ============================================================================

/// Acknowledgement of a published identity key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub peer_id: String,
}

/// The remote identity-key record service.
#[async_trait]
pub trait RemoteIdentityService: Send + Sync {
    /// Identity keys the service holds for `peer_id`.
    async fn fetch_identity_records(
        &self,
        peer_id: &str,
    ) -> Result<Vec<RemoteIdentityRecord>, ServiceError>;

    /// Record a key pair as issued to `peer_id`.
    async fn publish_identity_key(
        &self,
        peer_id: &str,
        identity_public_key: &[u8; 32],
        derived_public_key: &[u8; 32],
    ) -> Result<PublishAck, ServiceError>;
}

// ============================================================================
// Queued Calls
// ============================================================================

/// A replayable remote call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum QueuedCall {
    FetchIdentityRecords {
        peer_id: String,
    },
    PublishIdentityKey {
        peer_id: String,
        #[serde(with = "hex")]
        identity_public_key: [u8; 32],
        #[serde(with = "hex")]
        derived_public_key: [u8; 32],
    },
}

impl QueuedCall {
    pub fn publish(peer_id: &str, key_pair: &KeyPair) -> Self {
        QueuedCall::PublishIdentityKey {
            peer_id: peer_id.to_string(),
            identity_public_key: key_pair.identity_public_key,
            derived_public_key: key_pair.derived_public_key,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            QueuedCall::FetchIdentityRecords { .. } => "fetch_identity_records",
            QueuedCall::PublishIdentityKey { .. } => "publish_identity_key",
        }
    }

    pub fn peer_id(&self) -> &str {
        match self {
            QueuedCall::FetchIdentityRecords { peer_id }
            | QueuedCall::PublishIdentityKey { peer_id, .. } => peer_id,
        }
    }

    async fn execute(&self, service: &dyn RemoteIdentityService) -> Result<CallOutput, ServiceError> {
        match self {
            QueuedCall::FetchIdentityRecords { peer_id } => service
                .fetch_identity_records(peer_id)
                .await
                .map(CallOutput::Records),
            QueuedCall::PublishIdentityKey {
                peer_id,
                identity_public_key,
                derived_public_key,
            } => service
                .publish_identity_key(peer_id, identity_public_key, derived_public_key)
                .await
                .map(CallOutput::Published),
        }
    }
}

/// A persisted call waiting for connectivity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub call: QueuedCall,
    /// Unix seconds.
    pub enqueued_at: u64,
    /// Keep the item (and stop the drain) when replay fails without a response.
    pub retriable_if_offline: bool,
}

impl QueueItem {
    pub fn new(call: QueuedCall, retriable_if_offline: bool) -> Self {
        Self {
            call,
            enqueued_at: chrono::Utc::now().timestamp().max(0) as u64,
            retriable_if_offline,
        }
    }
}

/// Result of an executed call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallOutput {
    Records(Vec<RemoteIdentityRecord>),
    Published(PublishAck),
}

/// What `dispatch` did with a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatched {
    Completed(CallOutput),
    Queued { seq: Seq },
}

/// Outcome of one drain pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items replayed successfully.
    pub replayed: usize,
    /// Items dropped after a rejection or a non-retriable failure.
    pub dropped: usize,
    /// Items still queued when the pass ended.
    pub remaining: usize,
}

// ============================================================================
// Network Monitor
// ============================================================================

/// Owner of the process-wide connectivity state.
pub struct NetworkMonitor {
    tx: watch::Sender<NetworkStatus>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    pub fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    /// Report a connectivity change. Repeating the current status is a no-op.
    pub fn set(&self, status: NetworkStatus) {
        self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            info!(from = ?*current, to = ?status, "network status changed");
            *current = status;
            true
        });
    }
}

// ============================================================================
// Offline Queue
// ============================================================================

struct Inner {
    service: Arc<dyn RemoteIdentityService>,
    store: Arc<dyn QueueStore>,
    status: watch::Receiver<NetworkStatus>,
    policy: RetryPolicy,
    /// Serializes drains and queueable dispatches.
    gate: Mutex<()>,
}

/// Dispatches remote calls, deferring them while offline.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<Inner>,
}

impl OfflineQueue {
    pub fn new(
        service: Arc<dyn RemoteIdentityService>,
        store: Arc<dyn QueueStore>,
        status: watch::Receiver<NetworkStatus>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                service,
                store,
                status,
                policy,
                gate: Mutex::new(()),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.status.borrow().is_online()
    }

    /// Execute `call`, or queue it when it cannot run now.
    ///
    /// A call that is not queueable runs right away and fails while offline.
    /// A queueable call takes the drain gate before looking at the network
    /// status. Online, it waits behind any backlog and is appended after it
    /// if the backlog could not be fully drained.
    pub async fn dispatch(
        &self,
        call: QueuedCall,
        queue_if_offline: bool,
    ) -> Result<Dispatched, CoreError> {
        if !queue_if_offline {
            if !self.is_online() {
                debug!(method = call.method(), "offline, call not queueable");
                return Err(ServiceError::Offline.into());
            }
            return Ok(Dispatched::Completed(self.execute(&call).await?));
        }

        let _gate = self.inner.gate.lock().await;
        if !self.is_online() {
            return self.enqueue(call).await;
        }

        let backlog = self.drain_locked().await?;
        if backlog.remaining > 0 {
            return self.enqueue(call).await;
        }

        match self.execute(&call).await {
            Ok(output) => Ok(Dispatched::Completed(output)),
            Err(e) if !e.carries_response() => {
                warn!(method = call.method(), error = %e, "call failed without response, queueing");
                self.enqueue(call).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch identity records for a peer. Fails while offline.
    pub async fn fetch_identity_records(
        &self,
        peer_id: &str,
    ) -> Result<Vec<RemoteIdentityRecord>, CoreError> {
        let call = QueuedCall::FetchIdentityRecords {
            peer_id: peer_id.to_string(),
        };
        match self.dispatch(call, false).await? {
            Dispatched::Completed(CallOutput::Records(records)) => Ok(records),
            other => Err(ServiceError::BadResponse(format!(
                "unexpected dispatch result: {:?}",
                other
            ))
            .into()),
        }
    }

    /// Publish an issued key pair, queueing it while offline.
    pub async fn publish_identity_key(
        &self,
        peer_id: &str,
        key_pair: &KeyPair,
    ) -> Result<Dispatched, CoreError> {
        self.dispatch(QueuedCall::publish(peer_id, key_pair), true).await
    }

    /// Replay queued items in order.
    pub async fn drain(&self) -> Result<DrainReport, CoreError> {
        let _gate = self.inner.gate.lock().await;
        self.drain_locked().await
    }

    /// Number of items waiting.
    pub async fn pending_len(&self) -> Result<usize, CoreError> {
        Ok(self.inner.store.pending().await?.len())
    }

    /// Drain on every offline-to-online transition.
    ///
    /// Also drains once at start when already online, which picks up items
    /// persisted before a restart.
    pub fn spawn_reconnect_drain(&self) -> JoinHandle<()> {
        let queue = self.clone();
        let mut status = self.inner.status.clone();
        tokio::spawn(async move {
            let mut last = *status.borrow_and_update();
            if last.is_online() {
                queue.drain_logged().await;
            }
            while status.changed().await.is_ok() {
                let now = *status.borrow_and_update();
                if now.is_online() && !last.is_online() {
                    info!("back online, draining queued calls");
                    queue.drain_logged().await;
                }
                last = now;
            }
            debug!("network monitor gone, reconnect drain stopped");
        })
    }

    async fn drain_logged(&self) {
        match self.drain().await {
            Ok(report) => {
                if report.replayed + report.dropped > 0 || report.remaining > 0 {
                    info!(
                        replayed = report.replayed,
                        dropped = report.dropped,
                        remaining = report.remaining,
                        "drain finished"
                    );
                }
            }
            Err(e) => error!(error = %e, "drain failed"),
        }
    }

    async fn enqueue(&self, call: QueuedCall) -> Result<Dispatched, CoreError> {
        let method = call.method();
        let seq = self.inner.store.append(QueueItem::new(call, true)).await?;
        info!(seq, method, "call queued");
        Ok(Dispatched::Queued { seq })
    }

    async fn execute(&self, call: &QueuedCall) -> Result<CallOutput, ServiceError> {
        let service = self.inner.service.as_ref();
        retry_on_network_error(&self.inner.policy, move |attempt| {
            debug!(method = call.method(), attempt, "executing remote call");
            call.execute(service)
        })
        .await
    }

    async fn drain_locked(&self) -> Result<DrainReport, CoreError> {
        let pending = self.inner.store.pending().await?;
        let total = pending.len();
        let mut report = DrainReport::default();

        for (done, (seq, item)) in pending.into_iter().enumerate() {
            if !self.is_online() {
                info!(seq, "went offline, pausing drain");
                report.remaining = total - done;
                return Ok(report);
            }

            let method = item.call.method();
            match self.execute(&item.call).await {
                Ok(_) => {
                    self.inner.store.remove(seq).await?;
                    debug!(seq, method, "replayed queued call");
                    report.replayed += 1;
                }
                Err(e) if e.carries_response() => {
                    self.inner.store.remove(seq).await?;
                    error!(seq, method, peer = item.call.peer_id(), error = %e, "queued call rejected, dropped");
                    report.dropped += 1;
                }
                Err(e) if item.retriable_if_offline => {
                    warn!(seq, method, error = %e, "queued call still unreachable, keeping it");
                    report.remaining = total - done;
                    return Ok(report);
                }
                Err(e) => {
                    self.inner.store.remove(seq).await?;
                    error!(seq, method, peer = item.call.peer_id(), error = %e, "queued call failed, dropped");
                    report.dropped += 1;
                }
            }
        }

        Ok(report)
    }
}
