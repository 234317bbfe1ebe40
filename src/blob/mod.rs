//! Content-addressed blob storage interface.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha1::{Digest as Sha1Digest, Sha1};
use sha3::{Digest as Sha3Digest, Sha3_256};

use crate::error::Result;
use crate::types::Hash;

/// A SHA-1 blob address, kept alongside the SHA3 address for compatibility
/// with older peers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sha1Hash(pub [u8; 20]);

impl Sha1Hash {
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Hash({})", self.hex())
    }
}

impl Serialize for Sha1Hash {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for Sha1Hash {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("bad sha1 length"))?;
        Ok(Sha1Hash(arr))
    }
}

/// Store and fetch blobs by content hash. Implementations are internally
/// synchronized.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist a blob, returning its SHA-1 and SHA3-256 addresses.
    async fn store_blob(&self, data: Bytes) -> Result<(Sha1Hash, Hash)>;

    /// Fetch a blob by SHA3 address.
    async fn fetch_blob(&self, sha3: Hash) -> Result<Option<Bytes>>;
}

/// Hash a blob the way the store addresses it.
pub fn blob_hashes(data: &[u8]) -> (Sha1Hash, Hash) {
    let sha1: [u8; 20] = Sha1::digest(data).into();
    let sha3: [u8; 32] = Sha3_256::digest(data).into();
    (Sha1Hash(sha1), Hash(sha3))
}

/// In-memory blob store, keyed by SHA3 address.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<Hash, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn store_blob(&self, data: Bytes) -> Result<(Sha1Hash, Hash)> {
        let (sha1, sha3) = blob_hashes(&data);
        self.blobs.write().insert(sha3, data);
        Ok((sha1, sha3))
    }

    async fn fetch_blob(&self, sha3: Hash) -> Result<Option<Bytes>> {
        Ok(self.blobs.read().get(&sha3).cloned())
    }
}
