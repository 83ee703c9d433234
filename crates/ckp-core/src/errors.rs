//! Error types for the connection key pool.
//!
//! Transport and persistence problems are recovered as close to their source
//! as possible (retry engine, store fallback). What reaches callers is mostly
//! rejections from the remote service and allocation exhaustion.

use thiserror::Error;

use crate::store::Revision;

// ============================================================================
// Storage Errors
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Optimistic write lost against a concurrent change
    #[error("revision conflict on {id}: expected {expected}, found {found:?}")]
    Conflict {
        id: String,
        expected: Revision,
        found: Option<Revision>,
    },

    /// Storage backend unavailable or failed
    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    /// Stored body could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

// ============================================================================
// Remote Service Errors
// ============================================================================

/// Errors from calls to the remote identity service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The request never produced a response (connect failure, timeout, reset).
    #[error("transport failed: {0}")]
    Transport(String),

    /// The server answered, but not with success.
    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Device is offline and the call cannot be deferred.
    #[error("offline")]
    Offline,

    /// Response body could not be decoded.
    #[error("bad response: {0}")]
    BadResponse(String),
}

/// Classifies errors for `retry_on_network_error`.
pub trait ResponseAware {
    /// True when the request reached the server and the server replied.
    fn carries_response(&self) -> bool;
}

impl ResponseAware for ServiceError {
    fn carries_response(&self) -> bool {
        match self {
            ServiceError::Rejected { .. } | ServiceError::BadResponse(_) => true,
            ServiceError::Transport(_) | ServiceError::Offline => false,
        }
    }
}

// ============================================================================
// Pool Errors
// ============================================================================

/// Errors from the pool allocator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The allocator task has shut down.
    #[error("allocator for wallet {0} is closed")]
    Closed(String),

    /// A released pair was never handed out by this pool.
    #[error("release rejected: {0}")]
    InvalidRelease(String),
}

// ============================================================================
// Reconciliation Errors
// ============================================================================

/// Errors from resolving a key pair for a peer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// The pool produced no key pair at all; no channel can be opened.
    #[error("no connection key available for peer {peer_id}")]
    AllocationExhausted { peer_id: String },

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// The issued-key ledger could not be read or written.
    #[error("ledger error: {0}")]
    Ledger(#[from] StoreError),
}

// ============================================================================
// Unified Core Error
// ============================================================================

/// Unified error type for end-to-end connection establishment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
}

impl CoreError {
    /// Whether the caller should show "connection could not be established"
    /// rather than retrying later.
    pub fn is_terminal(&self) -> bool {
        match self {
            CoreError::Reconcile(ReconcileError::AllocationExhausted { .. }) => true,
            CoreError::Service(e) => e.carries_response(),
            _ => false,
        }
    }
}
