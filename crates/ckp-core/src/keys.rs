use std::sync::Arc;

use ckp_crypto::derive::{derive_connection_keys, ConnectionKeys, DeriveError};
use ckp_crypto::seed::WalletSeed;

use crate::types::KeyPair;

/// Per-index key derivation used by the generator.
///
/// Called from blocking worker threads, so implementations must be cheap to
/// share and must not await.
pub trait KeyDeriver: Send + Sync {
    fn derive_key_pair(&self, connection_index: u64) -> Result<KeyPair, DeriveError>;
}

/// Derives key pairs from a wallet seed.
#[derive(Clone)]
pub struct SeedDeriver {
    seed: Arc<WalletSeed>,
}

impl SeedDeriver {
    pub fn new(seed: Arc<WalletSeed>) -> Self {
        Self { seed }
    }

    /// Stable id under which this wallet's state is persisted.
    pub fn wallet_id(&self) -> String {
        self.seed.wallet_id()
    }

    /// Private halves for an index, for the handshake layer.
    pub fn connection_keys(&self, connection_index: u64) -> Result<ConnectionKeys, DeriveError> {
        derive_connection_keys(&self.seed, connection_index)
    }
}

impl KeyDeriver for SeedDeriver {
    fn derive_key_pair(&self, connection_index: u64) -> Result<KeyPair, DeriveError> {
        let keys = derive_connection_keys(&self.seed, connection_index)?;
        Ok(KeyPair {
            identity_public_key: keys.identity_pub(),
            derived_public_key: keys.derived_pub(),
            connection_index,
        })
    }
}
