use async_trait::async_trait;
use chunk_store::{Chunk, ChunkStore, StructuredVersions};
use log::{error, info, warn};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{
    Directory, DirectoryId, DirectoryRef, DirectorySink, DriveConfig, DriveError, DriveResult,
    FileContext, ParentId, TaskExecutor,
};

/// Strip the path down to its normal components, rooted at `/`.
pub(crate) fn normalise(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for comp in path.components() {
        if let Component::Normal(part) = comp {
            out.push(part);
        }
    }
    out
}

/// Split into `(parent_path, file_name)`.
pub(crate) fn split_parent(path: &Path) -> DriveResult<(PathBuf, String)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DriveError::NoSuchFile(path.display().to_string()))?
        .to_string();
    let parent = path
        .parent()
        .unwrap_or_else(|| Path::new("/"))
        .to_path_buf();
    Ok((parent, name))
}

/// The store-attempt callback bound into every directory: serialise, put
/// the blob, append the version, record the transition in the structured
/// version chain.
pub(crate) struct StoreSink {
    store: Arc<dyn ChunkStore>,
    versions: Arc<StructuredVersions>,
}

#[async_trait]
impl DirectorySink for StoreSink {
    async fn store_directory(&self, dir: DirectoryRef, path: PathBuf) {
        let bytes = match dir.serialise().await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("serialising {} failed: {}", path.display(), e);
                return;
            }
        };
        let chunk = Chunk::new(bytes);
        let version_id = chunk.id().clone();
        if let Err(e) = self.store.put(chunk).await {
            // the directory stays Ongoing until a later retry succeeds
            error!("storing {} failed: {}", path.display(), e);
            return;
        }
        let (directory_id, old_head, new_head) = if dir.versions_count().await == 0 {
            dir.initialise_versions(version_id).await
        } else {
            dir.add_new_version(version_id).await
        };
        if let Err(e) = self
            .versions
            .record(directory_id.as_str(), old_head.as_ref(), &new_head)
        {
            warn!(
                "recording version {} of {} failed: {}",
                new_head.index, directory_id, e
            );
        }
        info!("stored {} as version {}", path.display(), new_head.index);
    }
}

/// Path → directory resolver with an in-memory cache of every directory
/// resolved so far. Owns the store sink the directories call back on.
pub struct DirectoryHandler {
    store: Arc<dyn ChunkStore>,
    versions: Arc<StructuredVersions>,
    executor: TaskExecutor,
    config: DriveConfig,
    sink: Arc<dyn DirectorySink>,
    cache: RwLock<HashMap<PathBuf, Arc<Directory>>>,
}

impl DirectoryHandler {
    pub async fn new(
        store: Arc<dyn ChunkStore>,
        versions: Arc<StructuredVersions>,
        executor: TaskExecutor,
        config: DriveConfig,
        root_id: DirectoryId,
        create: bool,
    ) -> DriveResult<Self> {
        let sink: Arc<dyn DirectorySink> = Arc::new(StoreSink {
            store: store.clone(),
            versions: versions.clone(),
        });
        let handler = Self {
            store,
            versions,
            executor,
            config,
            sink,
            cache: RwLock::new(HashMap::new()),
        };
        // parent_id is never persisted, so the root gets a fresh one each
        // mount
        let root_parent = ParentId(DirectoryId::random());
        let root_path = PathBuf::from("/");
        let root = if create {
            Directory::new(
                root_parent,
                root_id,
                handler.executor.clone(),
                handler.sink.clone(),
                root_path.clone(),
                &handler.config,
            )
        } else {
            handler.load_directory(root_parent, &root_id, &root_path).await?
        };
        handler.cache.write().await.insert(root_path, Arc::new(root));
        Ok(handler)
    }

    async fn load_directory(
        &self,
        parent_id: ParentId,
        directory_id: &DirectoryId,
        path: &Path,
    ) -> DriveResult<Directory> {
        let head = self
            .versions
            .head(directory_id.as_str())?
            .ok_or_else(|| DriveError::NoSuchFile(path.display().to_string()))?;
        let blob = self.store.get(&head.id).await?;
        let versions = self.versions.versions(directory_id.as_str())?;
        Directory::from_serialised(
            parent_id,
            &blob,
            versions,
            self.executor.clone(),
            self.sink.clone(),
            path.to_path_buf(),
            &self.config,
        )
    }

    /// Resolve `path` to its directory, fetching and caching every
    /// directory along the way.
    pub async fn get(&self, path: &Path) -> DriveResult<Arc<Directory>> {
        let path = normalise(path);
        if let Some(dir) = self.cache.read().await.get(&path) {
            return Ok(dir.clone());
        }
        let mut current = self
            .cache
            .read()
            .await
            .get(Path::new("/"))
            .cloned()
            .expect("root directory always cached");
        let mut current_path = PathBuf::from("/");
        for comp in path.components() {
            let part = match comp {
                Component::Normal(part) => part,
                _ => continue,
            };
            current_path.push(part);
            if let Some(dir) = self.cache.read().await.get(&current_path) {
                current = dir.clone();
                continue;
            }
            let name = part
                .to_str()
                .ok_or_else(|| DriveError::NoSuchFile(current_path.display().to_string()))?;
            let meta = current.get_child(name).await?;
            let directory_id = meta
                .directory_id()
                .cloned()
                .ok_or_else(|| DriveError::NoSuchFile(current_path.display().to_string()))?;
            let parent_id = ParentId(current.directory_id().await);
            let loaded = self
                .load_directory(parent_id, &directory_id, &current_path)
                .await?;
            let mut cache = self.cache.write().await;
            current = cache
                .entry(current_path.clone())
                .or_insert_with(|| Arc::new(loaded))
                .clone();
        }
        Ok(current)
    }

    /// Insert `child` under its parent. A subdirectory also gets its
    /// in-memory directory created and cached.
    pub async fn add(&self, path: &Path, child: FileContext) -> DriveResult<()> {
        let path = normalise(path);
        let (parent_path, _name) = split_parent(&path)?;
        let parent = self.get(&parent_path).await?;
        let new_directory_id = child.meta_data.directory_id().cloned();
        parent.add_child(child).await?;
        if let Some(directory_id) = new_directory_id {
            let directory = Directory::new(
                ParentId(parent.directory_id().await),
                directory_id,
                self.executor.clone(),
                self.sink.clone(),
                path.clone(),
                &self.config,
            );
            self.cache.write().await.insert(path, Arc::new(directory));
        }
        Ok(())
    }

    /// Remove the entry at `path` and return it. A removed subdirectory's
    /// cached subtree is dropped, which forces its pending stores.
    pub async fn delete(&self, path: &Path) -> DriveResult<FileContext> {
        let path = normalise(path);
        let (parent_path, name) = split_parent(&path)?;
        let parent = self.get(&parent_path).await?;
        let removed = parent.remove_child(&name).await?;
        if removed.is_directory() {
            let mut cache = self.cache.write().await;
            cache.retain(|cached, _| !cached.starts_with(&path));
        }
        Ok(removed)
    }

    pub async fn rename(&self, old_path: &Path, new_path: &Path) -> DriveResult<()> {
        let old_path = normalise(old_path);
        let new_path = normalise(new_path);
        let (old_parent_path, old_name) = split_parent(&old_path)?;
        let (new_parent_path, new_name) = split_parent(&new_path)?;
        let old_parent = self.get(&old_parent_path).await?;
        let new_parent = self.get(&new_parent_path).await?;
        let meta = old_parent.get_child(&old_name).await?;
        if new_parent.has_child(&new_name).await {
            let existing = new_parent.get_child(&new_name).await?;
            if existing.is_directory() {
                return Err(DriveError::FileExists(new_path.display().to_string()));
            }
            drop(new_parent.remove_child(&new_name).await?);
        }
        if old_parent_path == new_parent_path {
            old_parent.rename_child(&old_name, &new_name).await?;
        } else {
            let mut moved = old_parent.remove_child(&old_name).await?;
            moved.meta_data.name = new_name.clone();
            new_parent.add_child(moved).await?;
        }
        if meta.is_directory() {
            self.rekey_cached_subtree(&old_path, &new_path).await;
            if let Some(dir) = self.cache.read().await.get(&new_path).cloned() {
                dir.set_new_parent(
                    ParentId(new_parent.directory_id().await),
                    self.sink.clone(),
                    new_path.clone(),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn rekey_cached_subtree(&self, old_prefix: &Path, new_prefix: &Path) {
        let mut cache = self.cache.write().await;
        let moved: Vec<PathBuf> = cache
            .keys()
            .filter(|cached| cached.starts_with(old_prefix))
            .cloned()
            .collect();
        for old_key in moved {
            if let Some(dir) = cache.remove(&old_key) {
                let suffix = old_key
                    .strip_prefix(old_prefix)
                    .expect("filtered on prefix")
                    .to_path_buf();
                cache.insert(new_prefix.join(suffix), dir);
            }
        }
    }
}
