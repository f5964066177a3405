use chunk_store::ChunkId;
use serde::{Deserialize, Serialize};

/// Where one plaintext chunk of a file lives in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDetail {
    /// Id of the ciphertext blob.
    pub id: ChunkId,
    /// Content key, hex. Derived from the plaintext, so identical chunks
    /// converge on identical blobs.
    pub key: String,
    /// Plaintext length of this chunk.
    pub plain_size: u64,
}

/// Opaque descriptor of a file's chunk composition. Serialized as part of
/// the owning directory's child metadata; an encryptor session is
/// reconstructed from it on next open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMap {
    pub file_size: u64,
    pub chunks: Vec<ChunkDetail>,
}

impl DataMap {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.file_size == 0
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = &ChunkId> {
        self.chunks.iter().map(|c| &c.id)
    }
}
