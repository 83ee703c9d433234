//! Parallel key-pair generation.
//!
//! A batch is split into contiguous index ranges, each derived on a blocking
//! worker. The batch never fails as a whole: whatever contiguous run from the
//! start index was derived is returned, possibly empty.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::keys::KeyDeriver;
use crate::types::KeyPair;

/// Fans key derivation out across blocking workers.
#[derive(Clone)]
pub struct KeyPairGenerator {
    deriver: Arc<dyn KeyDeriver>,
    workers: usize,
}

impl KeyPairGenerator {
    pub fn new(deriver: Arc<dyn KeyDeriver>, workers: usize) -> Self {
        Self {
            deriver,
            workers: workers.max(1),
        }
    }

    /// Generate pairs for `start_index .. start_index + count`.
    ///
    /// The result is sorted ascending and contiguous from `start_index`; it
    /// is shorter than `count` when any worker failed.
    pub async fn generate(&self, start_index: u64, count: usize) -> Vec<KeyPair> {
        if count == 0 {
            return Vec::new();
        }

        let chunk = count.div_ceil(self.workers);
        let mut set = JoinSet::new();
        let mut offset = 0usize;
        while offset < count {
            let len = chunk.min(count - offset);
            let first = start_index.saturating_add(offset as u64);
            let deriver = self.deriver.clone();
            set.spawn_blocking(move || derive_range(deriver.as_ref(), first, len));
            offset += len;
        }

        let mut pairs = Vec::with_capacity(count);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(mut batch) => pairs.append(&mut batch),
                Err(e) => error!(error = %e, "key generation worker died"),
            }
        }

        pairs.sort_by_key(|p| p.connection_index);
        let contiguous = pairs
            .iter()
            .zip(start_index..)
            .take_while(|(p, expected)| p.connection_index == *expected)
            .count();
        pairs.truncate(contiguous);

        if pairs.len() < count {
            warn!(
                start_index,
                requested = count,
                generated = pairs.len(),
                "key generation fell short"
            );
        } else {
            debug!(start_index, count, "generated key pairs");
        }
        pairs
    }
}

/// Derive `len` pairs from `first`, stopping at the first failure.
fn derive_range(deriver: &dyn KeyDeriver, first: u64, len: usize) -> Vec<KeyPair> {
    let mut out = Vec::with_capacity(len);
    for i in 0..len as u64 {
        let index = match first.checked_add(i) {
            Some(index) => index,
            None => break,
        };
        match deriver.derive_key_pair(index) {
            Ok(pair) => out.push(pair),
            Err(e) => {
                warn!(connection_index = index, error = %e, "key derivation failed");
                break;
            }
        }
    }
    out
}
