use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::{StoreError, StoreResult};

pub const HASH_METHOD_SHA256: &str = "sha256";

/// Name of an immutable chunk: `sha256:<64 hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(id_str: &str) -> StoreResult<Self> {
        let hash_hex = id_str
            .strip_prefix(HASH_METHOD_SHA256)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| StoreError::InvalidParam(format!("bad chunk id: {}", id_str)))?;
        if hash_hex.len() != 64 || hash_hex.chars().any(|c| !c.is_ascii_hexdigit()) {
            return Err(StoreError::InvalidParam(format!("bad chunk id: {}", id_str)));
        }
        Ok(Self(id_str.to_string()))
    }

    /// Compute the id of `data` itself.
    pub fn hash_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(format!(
            "{}:{}",
            HASH_METHOD_SHA256,
            hex::encode(hasher.finalize())
        ))
    }

    /// A fresh random id. Not the hash of anything; used for identities
    /// that need the same key space as chunk names.
    pub fn random() -> Self {
        let mut raw = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        Self(format!("{}:{}", HASH_METHOD_SHA256, hex::encode(raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex tail of the id, used by on-disk stores for directory fan-out.
    pub fn hash_hex(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or(&self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable blob whose id is fixed at construction.
#[derive(Debug, Clone)]
pub struct Chunk {
    id: ChunkId,
    data: Vec<u8>,
}

impl Chunk {
    pub fn new(data: Vec<u8>) -> Self {
        let id = ChunkId::hash_bytes(&data);
        Self { id, data }
    }

    pub fn id(&self) -> &ChunkId {
        &self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_is_content_hash() {
        let a = Chunk::new(b"hello".to_vec());
        let b = Chunk::new(b"hello".to_vec());
        let c = Chunk::new(b"world".to_vec());
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert!(a.id().as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_chunk_id_parse_rejects_garbage() {
        assert!(ChunkId::new("sha256:zz").is_err());
        assert!(ChunkId::new("md5:0000").is_err());
        let id = ChunkId::hash_bytes(b"x");
        assert!(ChunkId::new(id.as_str()).is_ok());
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(ChunkId::random(), ChunkId::random());
    }
}
