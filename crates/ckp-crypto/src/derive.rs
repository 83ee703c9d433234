//! Deterministic derivation of connection identity keys.
//!
//! okm = HKDF-SHA256(salt = "ckp/connection-keys/v1", ikm = seed,
//!                   info = "connection" || index_be_u64), 64 bytes
//! okm[0..32]  -> Ed25519 signing key (identity key)
//! okm[32..64] -> X25519 static secret (derived key)

use ed25519_dalek::{Signature, Signer, SigningKey};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::seed::WalletSeed;

const DERIVE_SALT: &[u8] = b"ckp/connection-keys/v1";
const DERIVE_LABEL: &[u8] = b"connection";

/// Error type for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeriveError {
    #[error("hkdf expand failed for connection index {0}")]
    Expand(u64),
    #[error("derivation unavailable: {0}")]
    Unavailable(String),
}

/// Private halves of one connection identity key pair.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ConnectionKeys {
    #[zeroize(skip)] // SigningKey implements Zeroize internally
    sign_key: SigningKey,
    #[zeroize(skip)] // StaticSecret implements Zeroize internally
    kex_key: StaticSecret,
    #[zeroize(skip)]
    connection_index: u64,
}

impl ConnectionKeys {
    pub fn connection_index(&self) -> u64 {
        self.connection_index
    }

    /// Ed25519 verifying key bytes offered to the peer.
    pub fn identity_pub(&self) -> [u8; 32] {
        self.sign_key.verifying_key().to_bytes()
    }

    /// X25519 public key bytes used by the handshake layer.
    pub fn derived_pub(&self) -> [u8; 32] {
        *X25519PublicKey::from(&self.kex_key).as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signature: Signature = self.sign_key.sign(message);
        signature.to_bytes()
    }

    pub fn key_exchange(&self, peer_pub: &[u8; 32]) -> [u8; 32] {
        let peer = X25519PublicKey::from(*peer_pub);
        *self.kex_key.diffie_hellman(&peer).as_bytes()
    }
}

/// Derive the key pair for `connection_index` from `seed`.
pub fn derive_connection_keys(
    seed: &WalletSeed,
    connection_index: u64,
) -> Result<ConnectionKeys, DeriveError> {
    let hk = Hkdf::<Sha256>::new(Some(DERIVE_SALT), seed.as_bytes());

    let mut info = Vec::with_capacity(DERIVE_LABEL.len() + 8);
    info.extend_from_slice(DERIVE_LABEL);
    info.extend_from_slice(&connection_index.to_be_bytes());

    let mut okm = [0u8; 64];
    hk.expand(&info, &mut okm)
        .map_err(|_| DeriveError::Expand(connection_index))?;

    let mut sign_bytes = [0u8; 32];
    let mut kex_bytes = [0u8; 32];
    sign_bytes.copy_from_slice(&okm[..32]);
    kex_bytes.copy_from_slice(&okm[32..]);
    okm.zeroize();

    let keys = ConnectionKeys {
        sign_key: SigningKey::from_bytes(&sign_bytes),
        kex_key: StaticSecret::from(kex_bytes),
        connection_index,
    };
    sign_bytes.zeroize();
    kex_bytes.zeroize();
    Ok(keys)
}
