//! Durable storage for pool documents and the offline action queue.
//!
//! Documents are JSON bodies with a revision counter. [`DocumentStore`] layers
//! the save policy on top of a raw [`DocumentBackend`]: forced saves replace
//! the body outright, ordinary saves merge onto the latest revision and fall
//! back to an unconditional insert when the compare-and-swap loses a race.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub use crate::errors::StoreError;
use crate::queue::QueueItem;

/// Monotonic per-document revision.
pub type Revision = u64;

/// Insertion sequence number of a queued item.
pub type Seq = u64;

// ============================================================================
// Data Models
// ============================================================================

/// A stored JSON document.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    pub revision: Revision,
    pub body: Value,
}

/// Options for [`DocumentStore::save`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Replace the stored body without merging or revision checks.
    pub force_overwrite: bool,
}

impl SaveOptions {
    pub fn forced() -> Self {
        Self {
            force_overwrite: true,
        }
    }
}

// ============================================================================
// Backend Traits
// ============================================================================

/// Raw document persistence.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Load a document by id.
    ///
    /// # Returns
    /// * `Ok(Some(doc))` if found
    /// * `Ok(None)` if not found
    /// * `Err(StoreError)` if the operation fails
    async fn load(&self, id: &str) -> Result<Option<Document>, StoreError>;

    /// Write a document body.
    ///
    /// # Arguments
    /// * `id` - Document id
    /// * `body` - Full new body
    /// * `expected` - `Some(rev)` to write only if the stored revision is
    ///   still `rev`; `None` to upsert unconditionally
    ///
    /// # Returns
    /// * `Ok(revision)` - The new revision
    /// * `Err(StoreError::Conflict)` if `expected` no longer matches
    /// * `Err(StoreError)` if the operation fails
    async fn write(
        &self,
        id: &str,
        body: Value,
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError>;

    /// Remove a document.
    ///
    /// # Returns
    /// * `Ok(true)` if a document was removed
    /// * `Ok(false)` if there was nothing to remove
    async fn remove(&self, id: &str) -> Result<bool, StoreError>;
}

/// Append/remove-only collection of queued calls.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append an item and return its sequence number.
    async fn append(&self, item: QueueItem) -> Result<Seq, StoreError>;

    /// All items still queued, in insertion order.
    async fn pending(&self) -> Result<Vec<(Seq, QueueItem)>, StoreError>;

    /// Remove an item. Removing an unknown sequence number is not an error.
    async fn remove(&self, seq: Seq) -> Result<(), StoreError>;
}

// ============================================================================
// Document Store
// ============================================================================

/// Save policy over a [`DocumentBackend`].
#[derive(Clone)]
pub struct DocumentStore {
    backend: Arc<dyn DocumentBackend>,
}

impl DocumentStore {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self { backend }
    }

    /// Fetch a document, failing with `NotFound` when absent.
    pub async fn get(&self, id: &str) -> Result<Document, StoreError> {
        self.backend
            .load(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Save `patch` under `id`.
    ///
    /// With `force_overwrite` the patch replaces the stored body. Otherwise
    /// it is shallow-merged onto the latest body and written against that
    /// revision; if the write conflicts, the patch is inserted as-is.
    pub async fn save(
        &self,
        id: &str,
        patch: Value,
        options: SaveOptions,
    ) -> Result<Revision, StoreError> {
        if options.force_overwrite {
            return self.backend.write(id, patch, None).await;
        }

        let current = match self.backend.load(id).await? {
            Some(doc) => doc,
            None => {
                debug!(id, "inserting new document");
                return self.backend.write(id, patch, None).await;
            }
        };

        let merged = merge_shallow(current.body, &patch);
        match self.backend.write(id, merged, Some(current.revision)).await {
            Err(StoreError::Conflict { expected, found, .. }) => {
                warn!(
                    id,
                    expected,
                    found = ?found,
                    "save conflicted, inserting patch unconditionally"
                );
                self.backend.write(id, patch, None).await
            }
            other => other,
        }
    }

    /// Remove a document if present.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.backend.remove(id).await
    }

    /// Load and decode a document body.
    pub async fn load<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>, StoreError> {
        match self.backend.load(id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc.body)?)),
            None => Ok(None),
        }
    }

    /// Encode and save a value.
    pub async fn store<T: Serialize>(
        &self,
        id: &str,
        value: &T,
        options: SaveOptions,
    ) -> Result<Revision, StoreError> {
        let body = serde_json::to_value(value)?;
        self.save(id, body, options).await
    }
}

/// Overlay top-level keys of `patch` onto `base`. Non-object bodies are replaced.
fn merge_shallow(base: Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base), Value::Object(patch)) => {
            for (k, v) in patch {
                base.insert(k.clone(), v.clone());
            }
            Value::Object(base)
        }
        (_, patch) => patch.clone(),
    }
}

// ============================================================================
// In-Memory Store Implementation
// ============================================================================

#[derive(Default)]
struct QueueState {
    next_seq: Seq,
    items: BTreeMap<Seq, QueueItem>,
}

/// Thread-safe in-memory store implementation for testing and MVP.
///
/// Uses `RwLock` for concurrent access with multiple readers or single writer.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    /// Documents indexed by id
    documents: Arc<RwLock<HashMap<String, Document>>>,
    /// Queued calls indexed by sequence number
    queue: Arc<RwLock<QueueState>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory store wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl DocumentBackend for InMemoryStore {
    async fn load(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents.get(id).cloned())
    }

    async fn write(
        &self,
        id: &str,
        body: Value,
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError> {
        let mut documents = self.documents.write().await;
        let found = documents.get(id).map(|d| d.revision);

        if let Some(expected) = expected {
            if found != Some(expected) {
                return Err(StoreError::Conflict {
                    id: id.to_string(),
                    expected,
                    found,
                });
            }
        }

        let revision = found.map_or(1, |r| r + 1);
        documents.insert(
            id.to_string(),
            Document {
                id: id.to_string(),
                revision,
                body,
            },
        );
        Ok(revision)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let mut documents = self.documents.write().await;
        Ok(documents.remove(id).is_some())
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn append(&self, item: QueueItem) -> Result<Seq, StoreError> {
        let mut queue = self.queue.write().await;
        queue.next_seq += 1;
        let seq = queue.next_seq;
        queue.items.insert(seq, item);
        Ok(seq)
    }

    async fn pending(&self) -> Result<Vec<(Seq, QueueItem)>, StoreError> {
        let queue = self.queue.read().await;
        Ok(queue
            .items
            .iter()
            .map(|(seq, item)| (*seq, item.clone()))
            .collect())
    }

    async fn remove(&self, seq: Seq) -> Result<(), StoreError> {
        let mut queue = self.queue.write().await;
        queue.items.remove(&seq);
        Ok(())
    }
}
