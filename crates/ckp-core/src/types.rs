use serde::{Deserialize, Serialize};

/// One pre-generated connection identity key pair.
///
/// Only public halves live here; the private halves are re-derived from the
/// wallet seed and `connection_index` when a handshake needs them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(with = "hex")]
    pub identity_public_key: [u8; 32], // Ed25519 bytes
    #[serde(with = "hex")]
    pub derived_public_key: [u8; 32], // X25519 bytes
    pub connection_index: u64,
}

impl KeyPair {
    /// Whether both public keys are exactly this pair's.
    pub fn matches(&self, identity_public_key: &[u8; 32], derived_public_key: &[u8; 32]) -> bool {
        &self.identity_public_key == identity_public_key
            && &self.derived_public_key == derived_public_key
    }
}

/// Persisted allocator state, one per wallet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    /// Unreserved pairs, ascending by `connection_index`.
    pub entries: Vec<KeyPair>,
    /// Highest index ever generated; `None` until the first generation.
    pub last_connection_key_index: Option<u64>,
}

impl PoolState {
    /// First index the next generation must use.
    pub fn next_index(&self) -> u64 {
        self.last_connection_key_index.map_or(0, |i| i + 1)
    }
}

/// Identity keys the remote service already has on record for a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIdentityRecord {
    pub peer_id: String,
    #[serde(with = "hex")]
    pub identity_public_key: [u8; 32],
    #[serde(with = "hex")]
    pub derived_public_key: [u8; 32],
}

/// Process-wide connectivity as reported by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl NetworkStatus {
    pub fn is_online(self) -> bool {
        matches!(self, NetworkStatus::Online)
    }
}
