use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::{Chunk, ChunkId, StoreError, StoreResult};

const CHUNK_DIR_NAME: &str = "chunks";
const CHUNK_FINAL_EXT: &str = "chunk";
const CHUNK_TMP_EXT: &str = "tmp";

/// Content-addressed blob store. `put` is idempotent, `get` returns the
/// exact bytes that were put, `get` and `delete` fail on a missing key.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn get(&self, name: &ChunkId) -> StoreResult<Vec<u8>>;
    async fn put(&self, chunk: Chunk) -> StoreResult<()>;
    async fn delete(&self, name: &ChunkId) -> StoreResult<()>;
}

/// In-memory store with operation counters, used by tests to observe
/// whether a code path touched storage at all.
#[derive(Default)]
pub struct MemChunkStore {
    chunks: Mutex<HashMap<ChunkId, Vec<u8>>>,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
}

impl MemChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }
}

#[async_trait]
impl ChunkStore for MemChunkStore {
    async fn get(&self, name: &ChunkId) -> StoreResult<Vec<u8>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.chunks
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn put(&self, chunk: Chunk) -> StoreResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let id = chunk.id().clone();
        self.chunks.lock().unwrap().insert(id, chunk.into_data());
        Ok(())
    }

    async fn delete(&self, name: &ChunkId) -> StoreResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.chunks
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}

/// On-disk store: `<base>/chunks/<2-hex-prefix>/<hash>.chunk`, written as
/// a `.tmp` file first and renamed once complete.
pub struct LocalChunkStore {
    chunk_dir: PathBuf,
}

impl LocalChunkStore {
    pub async fn open(base_dir: &Path) -> StoreResult<Self> {
        let chunk_dir = base_dir.join(CHUNK_DIR_NAME);
        fs::create_dir_all(&chunk_dir)
            .await
            .map_err(|e| StoreError::IoError(format!("create chunk dir failed: {}", e)))?;
        Ok(Self { chunk_dir })
    }

    fn chunk_path(&self, name: &ChunkId) -> PathBuf {
        let hash_hex = name.hash_hex();
        let prefix = &hash_hex[..2.min(hash_hex.len())];
        self.chunk_dir
            .join(prefix)
            .join(format!("{}.{}", hash_hex, CHUNK_FINAL_EXT))
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    async fn get(&self, name: &ChunkId) -> StoreResult<Vec<u8>> {
        let path = self.chunk_path(name);
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(StoreError::IoError(format!(
                "read {} failed: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn put(&self, chunk: Chunk) -> StoreResult<()> {
        let path = self.chunk_path(chunk.id());
        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!("chunk {} already stored", chunk.id());
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::IoError(format!("create prefix dir failed: {}", e)))?;
        }
        let tmp_path = path.with_extension(CHUNK_TMP_EXT);
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| StoreError::IoError(format!("create tmp chunk failed: {}", e)))?;
        file.write_all(chunk.data())
            .await
            .map_err(|e| StoreError::IoError(format!("write chunk failed: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::IoError(format!("sync chunk failed: {}", e)))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| StoreError::IoError(format!("finalise chunk failed: {}", e)))?;
        Ok(())
    }

    async fn delete(&self, name: &ChunkId) -> StoreResult<()> {
        let path = self.chunk_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(StoreError::IoError(format!(
                "remove {} failed: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_mem_store_counts_operations() {
        let store = MemChunkStore::new();
        let chunk = Chunk::new(b"abc".to_vec());
        let id = chunk.id().clone();
        store.put(chunk).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), b"abc");
        store.delete(&id).await.unwrap();
        assert!(matches!(
            store.get(&id).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.put_count(), 1);
        assert_eq!(store.get_count(), 2);
        assert_eq!(store.delete_count(), 1);
    }

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = LocalChunkStore::open(dir.path()).await.unwrap();
        let chunk = Chunk::new(vec![7u8; 4096]);
        let id = chunk.id().clone();
        store.put(chunk.clone()).await.unwrap();
        // idempotent
        store.put(chunk).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), vec![7u8; 4096]);
        store.delete(&id).await.unwrap();
        assert!(matches!(
            store.delete(&id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_store_leaves_no_tmp_files() {
        let dir = tempdir().unwrap();
        let store = LocalChunkStore::open(dir.path()).await.unwrap();
        store.put(Chunk::new(b"payload".to_vec())).await.unwrap();
        let mut stack = vec![dir.path().to_path_buf()];
        while let Some(p) = stack.pop() {
            for entry in std::fs::read_dir(&p).unwrap() {
                let entry = entry.unwrap();
                if entry.file_type().unwrap().is_dir() {
                    stack.push(entry.path());
                } else {
                    let name = entry.file_name();
                    assert!(name.to_string_lossy().ends_with(CHUNK_FINAL_EXT));
                }
            }
        }
    }
}
