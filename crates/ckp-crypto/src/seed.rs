//! Wallet seed handling.
//!
//! The seed is the only secret the connection key subsystem depends on.
//! Every connection identity key pair is a pure function of the seed and a
//! connection index, so losing the pool bookkeeping never loses key material.

use ed25519_dalek::SigningKey;
use rand_core::{OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hash::{derive_id, sha256};

/// Length of a wallet seed in bytes.
pub const SEED_LEN: usize = 32;

/// Error type for seed handling.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("invalid seed length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

/// 32-byte wallet seed, zeroized when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct WalletSeed {
    bytes: [u8; SEED_LEN],
}

impl WalletSeed {
    /// Generate a fresh random seed from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SEED_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; SEED_LEN]) -> Self {
        Self { bytes }
    }

    /// Build a seed from arbitrary-length secret material (for example a
    /// wallet private key). Exactly 32 bytes are taken verbatim; anything
    /// else is hashed down.
    pub fn from_secret(secret: &[u8]) -> Result<Self, SeedError> {
        if secret.is_empty() {
            return Err(SeedError::InvalidLength {
                expected: SEED_LEN,
                got: 0,
            });
        }
        if secret.len() == SEED_LEN {
            let mut bytes = [0u8; SEED_LEN];
            bytes.copy_from_slice(secret);
            return Ok(Self { bytes });
        }
        Ok(Self {
            bytes: sha256(secret),
        })
    }

    /// Raw seed bytes. Only the derivation code should need these.
    pub(crate) fn as_bytes(&self) -> &[u8; SEED_LEN] {
        &self.bytes
    }

    /// Stable wallet identifier, hex encoded.
    ///
    /// id = sha256(verifying key of the seed used directly as Ed25519 secret)
    pub fn wallet_id(&self) -> String {
        let root = SigningKey::from_bytes(&self.bytes);
        hex::encode(derive_id(&root.verifying_key().to_bytes()))
    }
}

impl std::fmt::Debug for WalletSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletSeed").finish_non_exhaustive()
    }
}
