//! Connection key pool for bootstrapping encrypted peer connections.
//!
//! This crate implements:
//! - A per-wallet pool of pre-generated identity key pairs, handed out once each
//! - Background replenishment across blocking workers
//! - Reconciliation against keys the remote identity service already holds
//! - An offline dispatch queue with ordered replay
//! - A retry engine with exponential backoff and bail
//! - Persistent storage abstraction

#![forbid(unsafe_code)]

// Pool and reconciliation
pub mod allocator;
pub mod generator;
pub mod reconcile;

// Remote calls
pub mod queue;
pub mod retry;

// Infrastructure
pub mod config;
pub mod store;

// Supporting modules
pub mod errors;
pub mod keys;
pub mod types;
pub mod harness;

// Optional remote service client
#[cfg(feature = "http-client")]
pub mod http_identity;

// Optional storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

#[cfg(test)]
mod proptests;

pub use allocator::{KeyPairSource, PoolAllocator};
pub use config::CoreConfig;
pub use errors::CoreError;
pub use queue::{NetworkMonitor, OfflineQueue, RemoteIdentityService};
pub use reconcile::{IssuedKeyLedger, ReconciliationCoordinator, Resolution};
pub use types::{KeyPair, NetworkStatus, PoolState, RemoteIdentityRecord};
