use async_trait::async_trait;
use chunk_store::{Chunk, ChunkId, ChunkStore, StoreResult, StructuredVersions};
use log::{debug, error};
use std::path::Path;
use std::sync::Arc;

use crate::directory_handler::split_parent;
use crate::{
    DirectoryHandler, DirectoryId, DriveConfig, DriveResult, FileContext, MetaData, TaskExecutor,
};

/// Storage hooks handed to encryptors and the resolver: a thin wrapper
/// over the backend that logs failures and re-raises them unchanged.
pub(crate) struct StoreHooks {
    backend: Arc<dyn ChunkStore>,
}

#[async_trait]
impl ChunkStore for StoreHooks {
    async fn get(&self, name: &ChunkId) -> StoreResult<Vec<u8>> {
        self.backend.get(name).await.map_err(|e| {
            error!("failed to get {} from storage: {}", name, e);
            e
        })
    }

    async fn put(&self, chunk: Chunk) -> StoreResult<()> {
        let name = chunk.id().clone();
        self.backend.put(chunk).await.map_err(|e| {
            error!("failed to put {} to storage: {}", name, e);
            e
        })
    }

    async fn delete(&self, name: &ChunkId) -> StoreResult<()> {
        self.backend.delete(name).await.map_err(|e| {
            error!("failed to delete {} from storage: {}", name, e);
            e
        })
    }
}

/// Outer façade routing OS-driver calls to the right directory and file
/// context.
pub struct Drive {
    // Dropped before the executor, so destructor-forced stores can still
    // run their callbacks.
    handler: DirectoryHandler,
    hooks: Arc<StoreHooks>,
    config: DriveConfig,
    executor: TaskExecutor,
}

impl Drive {
    pub async fn new(
        backend: Arc<dyn ChunkStore>,
        versions: Arc<StructuredVersions>,
        root_id: DirectoryId,
        create: bool,
        config: DriveConfig,
    ) -> DriveResult<Self> {
        let executor = TaskExecutor::new(config.timer_worker_threads);
        let hooks = Arc::new(StoreHooks { backend });
        let handler = DirectoryHandler::new(
            hooks.clone(),
            versions,
            executor.clone(),
            config.clone(),
            root_id,
            create,
        )
        .await?;
        Ok(Self {
            handler,
            hooks,
            config,
            executor,
        })
    }

    /// Create a file or directory entry. A new file starts open with a
    /// live encryptor; the driver pairs this with a later `release`.
    pub async fn create(&self, relative_path: &Path, is_directory: bool) -> DriveResult<()> {
        let (_, name) = split_parent(relative_path)?;
        let mut file_context = FileContext::new(name, is_directory);
        if !file_context.is_directory() {
            file_context.initialise_encryptor(self.hooks.clone(), &self.executor);
            file_context.set_open_count(1);
        }
        self.handler.add(relative_path, file_context).await
    }

    pub async fn open(&self, relative_path: &Path) -> DriveResult<()> {
        let (parent_path, name) = split_parent(relative_path)?;
        let parent = self.handler.get(&parent_path).await?;
        parent.open_child(&name, self.hooks.clone()).await
    }

    pub async fn flush(&self, relative_path: &Path) -> DriveResult<()> {
        let (parent_path, name) = split_parent(relative_path)?;
        let parent = self.handler.get(&parent_path).await?;
        parent.flush_child(&name).await
    }

    pub async fn release(&self, relative_path: &Path) -> DriveResult<()> {
        let (parent_path, name) = split_parent(relative_path)?;
        let parent = self.handler.get(&parent_path).await?;
        parent.release_child(&name).await
    }

    /// End of a directory enumeration; rewinds the readdir cursor.
    pub async fn release_dir(&self, relative_path: &Path) -> DriveResult<()> {
        let directory = self.handler.get(relative_path).await?;
        directory.reset_children_counter().await;
        Ok(())
    }

    pub async fn delete(&self, relative_path: &Path) -> DriveResult<()> {
        let removed = self.handler.delete(relative_path).await?;
        // destroying the removed context runs its final flush to
        // completion before delete returns
        drop(removed);
        Ok(())
    }

    pub async fn rename(
        &self,
        old_relative_path: &Path,
        new_relative_path: &Path,
    ) -> DriveResult<()> {
        self.handler.rename(old_relative_path, new_relative_path).await
    }

    /// Read into `buf` at `offset`. Returns the number of readable bytes:
    /// 0 past the end of the file, `size - offset` when the range
    /// straddles it.
    pub async fn read(
        &self,
        relative_path: &Path,
        buf: &mut [u8],
        offset: u64,
    ) -> DriveResult<usize> {
        debug!(
            "reading {} bytes of {} at offset {}",
            buf.len(),
            relative_path.display(),
            offset
        );
        let (parent_path, name) = split_parent(relative_path)?;
        let parent = self.handler.get(&parent_path).await?;
        parent.read_child(&name, buf, offset).await
    }

    /// Write `data` at `offset`, growing the file and scheduling the
    /// parent directory for storing.
    pub async fn write(
        &self,
        relative_path: &Path,
        data: &[u8],
        offset: u64,
    ) -> DriveResult<usize> {
        debug!(
            "writing {} bytes to {} at offset {}",
            data.len(),
            relative_path.display(),
            offset
        );
        let (parent_path, name) = split_parent(relative_path)?;
        let parent = self.handler.get(&parent_path).await?;
        parent.write_child(&name, data, offset).await
    }

    /// Snapshot of the entry's metadata.
    pub async fn get_context(&self, relative_path: &Path) -> DriveResult<MetaData> {
        let (parent_path, name) = split_parent(relative_path)?;
        let parent = self.handler.get(&parent_path).await?;
        parent.get_child(&name).await
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    pub(crate) fn handler(&self) -> &DirectoryHandler {
        &self.handler
    }
}
