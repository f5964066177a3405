use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use log::warn;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chunk_store::{Chunk, ChunkId, ChunkStore};

use crate::{ChunkDetail, DataMap, EncryptError, EncryptResult, CHUNK_PLAIN_SIZE};

const NONCE_LEN: usize = 12;

struct ChunkSlot {
    data: Vec<u8>,
    dirty: bool,
}

/// One streaming encrypt/decrypt session over a file's `DataMap`.
///
/// Reads fetch and decrypt chunks lazily; writes land in in-memory slots
/// and reach the store only on `flush`, which re-encrypts every dirty
/// chunk, deletes the blobs it superseded and rewrites the data map.
/// Construction does no I/O at all.
///
/// Not internally synchronized; the owner serializes access.
pub struct SelfEncryptor {
    store: Arc<dyn ChunkStore>,
    data_map: DataMap,
    slots: BTreeMap<u64, ChunkSlot>,
    size: u64,
    dirty: bool,
}

impl SelfEncryptor {
    pub fn new(data_map: DataMap, store: Arc<dyn ChunkStore>) -> Self {
        let size = data_map.file_size;
        Self {
            store,
            data_map,
            slots: BTreeMap::new(),
            size,
            dirty: false,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The descriptor as of the last flush.
    pub fn data_map(&self) -> &DataMap {
        &self.data_map
    }

    /// Read up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes actually readable: 0 past the end, `size - offset` when the
    /// range straddles it.
    pub async fn read(&mut self, buf: &mut [u8], offset: u64) -> EncryptResult<usize> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((self.size - offset) as usize);
        let mut copied = 0usize;
        while copied < want {
            let pos = offset + copied as u64;
            let index = pos / CHUNK_PLAIN_SIZE;
            let in_off = (pos % CHUNK_PLAIN_SIZE) as usize;
            let span = (want - copied).min((CHUNK_PLAIN_SIZE as usize) - in_off);
            let slot = self.ensure_slot(index).await?;
            for (i, out) in buf[copied..copied + span].iter_mut().enumerate() {
                *out = slot.data.get(in_off + i).copied().unwrap_or(0);
            }
            copied += span;
        }
        Ok(want)
    }

    /// Write `data` at `offset`, growing the session size as needed.
    pub async fn write(&mut self, data: &[u8], offset: u64) -> EncryptResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut written = 0usize;
        while written < data.len() {
            let pos = offset + written as u64;
            let index = pos / CHUNK_PLAIN_SIZE;
            let in_off = (pos % CHUNK_PLAIN_SIZE) as usize;
            let span = (data.len() - written).min((CHUNK_PLAIN_SIZE as usize) - in_off);
            let slot = self.ensure_slot(index).await?;
            if slot.data.len() < in_off + span {
                slot.data.resize(in_off + span, 0);
            }
            slot.data[in_off..in_off + span].copy_from_slice(&data[written..written + span]);
            slot.dirty = true;
            written += span;
        }
        self.size = self.size.max(offset + data.len() as u64);
        self.dirty = true;
        Ok(())
    }

    /// Persist every dirty chunk and rewrite the data map. A flush with
    /// nothing dirty is a no-op.
    pub async fn flush(&mut self) -> EncryptResult<()> {
        if !self.dirty && self.size == self.data_map.file_size {
            return Ok(());
        }
        let chunk_count = self.size.div_ceil(CHUNK_PLAIN_SIZE);
        let mut new_chunks = Vec::with_capacity(chunk_count as usize);
        for index in 0..chunk_count {
            let want_len = self.chunk_plain_len(index);
            let reusable = self
                .data_map
                .chunks
                .get(index as usize)
                .filter(|detail| detail.plain_size == want_len)
                .cloned();
            let needs_rewrite = match self.slots.get(&index) {
                Some(slot) => slot.dirty || slot.data.len() != want_len as usize,
                None => reusable.is_none(),
            };
            if !needs_rewrite {
                new_chunks.push(reusable.expect("clean chunk with no stored detail"));
                continue;
            }
            let (detail, chunk) = {
                let slot = self.ensure_slot(index).await?;
                slot.data.resize(want_len as usize, 0);
                encrypt_chunk(&slot.data)?
            };
            self.store.put(chunk).await?;
            if let Some(slot) = self.slots.get_mut(&index) {
                slot.dirty = false;
            }
            new_chunks.push(detail);
        }
        self.delete_superseded(&new_chunks).await;
        self.data_map = DataMap {
            file_size: self.size,
            chunks: new_chunks,
        };
        self.dirty = false;
        Ok(())
    }

    fn chunk_plain_len(&self, index: u64) -> u64 {
        let start = index * CHUNK_PLAIN_SIZE;
        CHUNK_PLAIN_SIZE.min(self.size - start)
    }

    async fn ensure_slot(&mut self, index: u64) -> EncryptResult<&mut ChunkSlot> {
        if !self.slots.contains_key(&index) {
            let data = match self.data_map.chunks.get(index as usize) {
                Some(detail) => {
                    let cipher_bytes = self.store.get(&detail.id).await?;
                    decrypt_chunk(detail, &cipher_bytes)?
                }
                None => Vec::new(),
            };
            self.slots.insert(index, ChunkSlot { data, dirty: false });
        }
        Ok(self.slots.get_mut(&index).expect("slot just inserted"))
    }

    async fn delete_superseded(&self, new_chunks: &[ChunkDetail]) {
        let retained: HashSet<&ChunkId> = new_chunks.iter().map(|c| &c.id).collect();
        for old in &self.data_map.chunks {
            if retained.contains(&old.id) {
                continue;
            }
            if let Err(e) = self.store.delete(&old.id).await {
                warn!("deleting superseded chunk {} failed: {}", old.id, e);
            }
        }
    }
}

fn derive_nonce(key: &[u8]) -> [u8; NONCE_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(b"nonce");
    let digest = hasher.finalize();
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    nonce
}

fn encrypt_chunk(plain: &[u8]) -> EncryptResult<(ChunkDetail, Chunk)> {
    let key_bytes: [u8; 32] = Sha256::digest(plain).into();
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = derive_nonce(&key_bytes);
    let cipher_bytes = cipher
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|e| EncryptError::Crypto(format!("encrypt failed: {}", e)))?;
    let chunk = Chunk::new(cipher_bytes);
    let detail = ChunkDetail {
        id: chunk.id().clone(),
        key: hex::encode(key_bytes),
        plain_size: plain.len() as u64,
    };
    Ok((detail, chunk))
}

fn decrypt_chunk(detail: &ChunkDetail, cipher_bytes: &[u8]) -> EncryptResult<Vec<u8>> {
    let key_bytes = hex::decode(&detail.key)
        .map_err(|e| EncryptError::InvalidParam(format!("bad chunk key: {}", e)))?;
    if key_bytes.len() != 32 {
        return Err(EncryptError::InvalidParam("bad chunk key length".to_string()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = derive_nonce(&key_bytes);
    let plain = cipher
        .decrypt(Nonce::from_slice(&nonce), cipher_bytes)
        .map_err(|e| EncryptError::Crypto(format!("decrypt failed: {}", e)))?;
    if plain.len() as u64 != detail.plain_size {
        return Err(EncryptError::Crypto(format!(
            "chunk length mismatch: {} != {}",
            plain.len(),
            detail.plain_size
        )));
    }
    Ok(plain)
}
