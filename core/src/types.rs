use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::crypto::EncryptionConfig;
use crate::{Error, Result};

/// Current on-disk format version written to the repository `config` file.
pub const FORMAT_VERSION: u32 = 1;

/// Name of this repository format, used in error messages.
pub const FORMAT_NAME: &str = "strata-1";

/// Identifier of a stored chunk. Allocated randomly or sequentially, never derived
/// from content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(u64);

impl ChunkId {
    pub const MIN: ChunkId = ChunkId(0);
    pub const MAX: ChunkId = ChunkId(u64::MAX);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(rand::random::<u64>() % u64::MAX)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl FromStr for ChunkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| Error::Other(format!("invalid chunk id: {s}")))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Numeric identity of a client, also the name of its repository directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    pub const MIN: ClientId = ClientId(0);
    pub const MAX: ClientId = ClientId(u64::MAX);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(rand::random::<u64>() % u64::MAX)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Directory holding this client's metadata forest.
    pub fn dirname(self) -> String {
        format!("client-{}", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// BLAKE3 digest of chunk or file content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn from_hasher(hasher: &blake3::Hasher) -> Self {
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl FromStr for Checksum {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self(array))
    }
}

impl Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Checksum::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.short_string())
    }
}

/// A generation of a specific client. Numbers are unique within one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenerationId {
    pub client: String,
    pub number: u64,
}

impl GenerationId {
    pub fn new(client: impl Into<String>, number: u64) -> Self {
        Self {
            client: client.into(),
            number,
        }
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.number)
    }
}

/// Repository identity, stored unfiltered at the repository root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now(),
            compression: false,
            encryption: None,
        }
    }
}

/// Tunables of a repository session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySettings {
    /// Seconds to keep retrying a held lock before giving up.
    pub lock_timeout: u64,
    pub lock_initial_backoff_ms: u64,
    pub lock_max_backoff_ms: u64,
    /// Maximum number of entries in one metadata tree node.
    pub node_size: usize,
    pub idpath_depth: u32,
    pub idpath_bits: u32,
    pub idpath_skip: u32,
    /// Average chunk size for content-defined chunking.
    pub chunk_size: u32,
    pub compress: bool,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            lock_timeout: 60,
            lock_initial_backoff_ms: 50,
            lock_max_backoff_ms: 2000,
            node_size: 128,
            idpath_depth: 3,
            idpath_bits: 12,
            idpath_skip: 13,
            chunk_size: 1024 * 1024,
            compress: false,
        }
    }
}

impl RepositorySettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }

    pub fn lock_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_initial_backoff_ms.max(1))
    }

    pub fn lock_max_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_max_backoff_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_hex_roundtrip() {
        let id = ChunkId::new(0xdead_beef);
        assert_eq!(id.to_string(), "00000000deadbeef");
        assert_eq!(ChunkId::from_str("00000000deadbeef").unwrap(), id);
        assert!(ChunkId::from_str("not-hex").is_err());
    }

    #[test]
    fn test_checksum_serde_uses_hex() {
        let checksum = Checksum::of(b"xyz");
        let json = serde_json::to_string(&checksum).unwrap();
        assert_eq!(json, format!("\"{}\"", checksum.to_hex()));
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checksum);
    }

    #[test]
    fn test_settings_defaults() {
        let settings: RepositorySettings = serde_json::from_str("{\"node_size\": 8}").unwrap();
        assert_eq!(settings.node_size, 8);
        assert_eq!(settings.lock_timeout, 60);
        assert_eq!(settings.idpath_depth, 3);
    }
}
