use async_trait::async_trait;
use chunk_store::{ChunkId, ChunkStore, VersionName};
use log::{debug, error, info, warn};
use self_encrypt::SelfEncryptor;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::file_context::FileContext;
use crate::{
    DeferredTask, DirectoryId, DriveConfig, DriveError, DriveResult, MetaData, ParentId,
    TaskExecutor,
};

/// Extra slack granted on top of the store debounce when tearing a
/// directory down.
pub const DIRECTORY_TEARDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Pending,
    Ongoing,
    Complete,
}

/// Receiver of store attempts. One attempt: serialise the directory, put
/// the blob, append the version, record the transition. Failures are the
/// sink's to log; the directory stays `Ongoing` until a successful
/// attempt.
#[async_trait]
pub trait DirectorySink: Send + Sync {
    async fn store_directory(&self, dir: DirectoryRef, path: PathBuf);
}

#[derive(Clone)]
pub(crate) struct StoreBinding {
    pub(crate) sink: Arc<dyn DirectorySink>,
    pub(crate) path: PathBuf,
}

/// On-wire form of a directory. `parent_id` is deliberately absent; the
/// resolver reconstructs it from context.
#[derive(Serialize, Deserialize)]
struct DirectoryWire {
    directory_id: DirectoryId,
    max_versions: usize,
    children: Vec<MetaData>,
}

pub(crate) struct DirectoryState {
    parent_id: ParentId,
    directory_id: DirectoryId,
    timer: DeferredTask,
    binding: StoreBinding,
    versions: VecDeque<VersionName>,
    max_versions: usize,
    children: Vec<FileContext>,
    children_count_position: usize,
}

impl DirectoryState {
    fn find(&self, name: &str) -> Option<&FileContext> {
        self.children.iter().find(|c| c.meta_data.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut FileContext> {
        self.children.iter_mut().find(|c| c.meta_data.name == name)
    }

    fn sort_and_reset_children_counter(&mut self) {
        self.children
            .sort_by(|lhs, rhs| lhs.meta_data.name.cmp(&rhs.meta_data.name));
        self.children_count_position = 0;
    }
}

pub(crate) struct DirectoryCore {
    pub(crate) state: Mutex<DirectoryState>,
    store_state: watch::Sender<StoreState>,
    pub(crate) executor: TaskExecutor,
    file_delay: Duration,
    store_delay: Duration,
}

impl DirectoryCore {
    /// Upcall target of the per-file teardown timer; also reachable from
    /// `serialise`, so it tolerates the child being flushed already.
    pub(crate) async fn flush_child_and_delete_encryptor(&self, context_id: u64) {
        let mut state = self.state.lock().await;
        if let Some(child) = state
            .children
            .iter_mut()
            .find(|c| c.context_id() == context_id)
        {
            if child.self_encryptor.is_some() {
                flush_encryptor(child).await;
            }
        }
    }

    /// Final flush for a context being destroyed. The session has already
    /// left the children list, so it moves out here; the flush still runs
    /// under the directory lock so it cannot race `serialise` or
    /// in-flight writes, and the dropping thread blocks until it lands.
    pub(crate) fn flush_departing_encryptor(
        self: Arc<Self>,
        name: String,
        mut encryptor: SelfEncryptor,
    ) {
        let wait = self.file_delay + DIRECTORY_TEARDOWN_GRACE;
        let core = self.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        self.executor.spawn(async move {
            let _state = core.state.lock().await;
            if let Err(e) = encryptor.flush().await {
                warn!("final flush of {} failed: {}", name, e);
            }
            let _ = tx.send(());
        });
        if rx.recv_timeout(wait).is_err() {
            error!("final flush of a removed file did not complete before teardown");
        }
    }
}

/// Flush the child's encryptor, copy the refreshed data map into its
/// metadata, and drop the session if the file is closed. Flush failures
/// are logged; the snapshot then carries the last flushed state.
async fn flush_encryptor(child: &mut FileContext) {
    if let Some(encryptor) = child.self_encryptor.as_mut() {
        match encryptor.flush().await {
            Ok(()) => child.meta_data.set_data_map(encryptor.data_map().clone()),
            Err(e) => warn!("flushing {} failed: {}", child.meta_data.name, e),
        }
        if child.open_count.load(Ordering::SeqCst) == 0 {
            child.self_encryptor = None;
        }
        child.flushed = true;
    }
}

fn store_fire(
    core: Weak<DirectoryCore>,
    binding: StoreBinding,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        match core.upgrade() {
            Some(core) => {
                info!("storing {}", binding.path.display());
                binding
                    .sink
                    .store_directory(DirectoryRef { core }, binding.path)
                    .await;
            }
            None => debug!(
                "{} went away before its store fired",
                binding.path.display()
            ),
        }
    }
}

/// Arm (or advance) the deferred store. With `use_delay` the timer is
/// (re-)armed for one debounce window. Without it, an already-pending
/// store is dispatched right now and nothing happens when no store is
/// pending: this path never creates store pressure, it only advances it.
fn do_schedule_for_storing(core: &Arc<DirectoryCore>, state: &mut DirectoryState, use_delay: bool) {
    let store_state = *core.store_state.borrow();
    if use_delay {
        let fire = store_fire(Arc::downgrade(core), state.binding.clone());
        let cancelled = state.timer.arm(core.store_delay, fire);
        if store_state != StoreState::Complete {
            if cancelled > 0 {
                debug_assert_eq!(cancelled, 1);
                debug!("rescheduled pending store of {}", state.directory_id);
            } else {
                warn!("failed to cancel store timer of {}", state.directory_id);
            }
        }
        core.store_state.send_replace(StoreState::Pending);
    } else if store_state == StoreState::Pending {
        if state.timer.cancel() > 0 {
            info!("bringing forward pending store of {}", state.directory_id);
            let fire = store_fire(Arc::downgrade(core), state.binding.clone());
            core.executor.spawn(fire);
        } else {
            warn!("failed to cancel store timer of {}", state.directory_id);
        }
        core.store_state.send_replace(StoreState::Pending);
    } else {
        debug!("no store pending for {}", state.directory_id);
    }
}

/// Shared, non-owning handle to a directory. Store callbacks and the
/// drive's routing work through this; dropping it never triggers the
/// teardown protocol.
#[derive(Clone)]
pub struct DirectoryRef {
    pub(crate) core: Arc<DirectoryCore>,
}

impl DirectoryRef {
    // ---- store-attempt protocol ----

    /// Start a store attempt: flush every child that still holds a live
    /// encryptor, mark the state `Ongoing` and return the wire blob.
    pub async fn serialise(&self) -> DriveResult<Vec<u8>> {
        let mut state = self.core.state.lock().await;
        for child in state.children.iter_mut() {
            if child.self_encryptor.is_some() {
                if let Some(timer) = child.timer.as_mut() {
                    timer.cancel();
                }
                flush_encryptor(child).await;
                // the marker only coordinates within this pass
                debug_assert!(child.flushed);
                child.flushed = false;
            }
        }
        let wire = DirectoryWire {
            directory_id: state.directory_id.clone(),
            max_versions: state.max_versions,
            children: state.children.iter().map(|c| c.meta_data.clone()).collect(),
        };
        self.core.store_state.send_replace(StoreState::Ongoing);
        serde_json::to_vec(&wire)
            .map_err(|e| DriveError::ParsingError(format!("serialise directory failed: {}", e)))
    }

    /// End a store attempt: append the version, evict past the bound, set
    /// `Complete` and wake waiters. Returns the directory id with the
    /// previous and new heads so the caller can extend the version chain.
    pub async fn add_new_version(
        &self,
        version_id: ChunkId,
    ) -> (DirectoryId, Option<VersionName>, VersionName) {
        let mut state = self.core.state.lock().await;
        let previous = state.versions.front().cloned();
        let index = previous.as_ref().map(|v| v.index + 1).unwrap_or(0);
        let new_head = VersionName::new(index, version_id);
        state.versions.push_front(new_head.clone());
        while state.versions.len() > state.max_versions {
            state.versions.pop_back();
        }
        self.core.store_state.send_replace(StoreState::Complete);
        (state.directory_id.clone(), previous, new_head)
    }

    /// First store of a fresh directory.
    pub async fn initialise_versions(
        &self,
        version_id: ChunkId,
    ) -> (DirectoryId, Option<VersionName>, VersionName) {
        let result = self.add_new_version(version_id).await;
        debug_assert!(result.1.is_none(), "initialise_versions on a stored directory");
        result
    }

    pub async fn schedule_for_storing(&self) {
        let mut state = self.core.state.lock().await;
        do_schedule_for_storing(&self.core, &mut state, true);
    }

    pub async fn store_immediately_if_pending(&self) {
        let mut state = self.core.state.lock().await;
        do_schedule_for_storing(&self.core, &mut state, false);
    }

    /// Block until no store attempt is in flight, then re-bind identity
    /// and store target. Used when moving a subtree.
    pub async fn set_new_parent(
        &self,
        parent_id: ParentId,
        sink: Arc<dyn DirectorySink>,
        path: PathBuf,
    ) {
        let mut rx = self.core.store_state.subscribe();
        let deadline = tokio::time::Instant::now() + DIRECTORY_TEARDOWN_GRACE;
        let mut pending = Some((parent_id, StoreBinding { sink, path }));
        let mut timed_out = false;
        loop {
            {
                let mut state = self.core.state.lock().await;
                if timed_out || *self.core.store_state.borrow() != StoreState::Ongoing {
                    if timed_out {
                        warn!(
                            "re-parenting {} while its store is still ongoing",
                            state.directory_id
                        );
                    }
                    let (parent_id, binding) = pending.take().expect("re-parent applied twice");
                    state.parent_id = parent_id;
                    state.binding = binding;
                    return;
                }
            }
            timed_out = tokio::time::timeout_at(deadline, rx.changed()).await.is_err();
        }
    }

    pub async fn wait_store_complete(&self) {
        let mut rx = self.core.store_state.subscribe();
        let _ = rx.wait_for(|s| *s == StoreState::Complete).await;
    }

    // ---- child operations ----

    pub async fn has_child(&self, name: &str) -> bool {
        self.core.state.lock().await.find(name).is_some()
    }

    pub async fn get_child(&self, name: &str) -> DriveResult<MetaData> {
        let state = self.core.state.lock().await;
        let child = state
            .find(name)
            .ok_or_else(|| DriveError::NoSuchFile(name.to_string()))?;
        // An open file must have its encryptor session and teardown timer.
        debug_assert!(
            child.open_count() == 0
                || child.is_directory()
                || (child.self_encryptor.is_some() && child.timer.is_some())
        );
        Ok(child.meta_data.clone())
    }

    pub async fn add_child(&self, mut child: FileContext) -> DriveResult<()> {
        let mut state = self.core.state.lock().await;
        if state.find(&child.meta_data.name).is_some() {
            let name = child.meta_data.name.clone();
            // a rejected child's destructor flushes through its previous
            // parent under that directory's lock; destroy it unlocked
            drop(state);
            drop(child);
            return Err(DriveError::FileExists(name));
        }
        child.parent = Arc::downgrade(&self.core);
        if !child.is_directory() && child.self_encryptor.is_some() && child.open_count() == 0 {
            // a teardown armed under a previous parent upcalls into that
            // parent; re-arm it here
            child.schedule_deletion_of_encryptor(self.core.file_delay);
        }
        state.children.push(child);
        state.sort_and_reset_children_counter();
        do_schedule_for_storing(&self.core, &mut state, true);
        Ok(())
    }

    pub async fn remove_child(&self, name: &str) -> DriveResult<FileContext> {
        let mut state = self.core.state.lock().await;
        let index = state
            .children
            .iter()
            .position(|c| c.meta_data.name == name)
            .ok_or_else(|| DriveError::NoSuchFile(name.to_string()))?;
        let child = state.children.remove(index);
        state.sort_and_reset_children_counter();
        do_schedule_for_storing(&self.core, &mut state, true);
        Ok(child)
    }

    /// The caller guarantees `new_name` is unused.
    pub async fn rename_child(&self, old_name: &str, new_name: &str) -> DriveResult<()> {
        let mut state = self.core.state.lock().await;
        debug_assert!(state.find(new_name).is_none());
        let child = state
            .find_mut(old_name)
            .ok_or_else(|| DriveError::NoSuchFile(old_name.to_string()))?;
        child.meta_data.name = new_name.to_string();
        state.sort_and_reset_children_counter();
        do_schedule_for_storing(&self.core, &mut state, true);
        Ok(())
    }

    /// Cursor-based enumeration serving repeated read-directory calls.
    pub async fn get_child_and_increment_counter(&self) -> Option<MetaData> {
        let mut state = self.core.state.lock().await;
        if state.children_count_position < state.children.len() {
            let meta = state.children[state.children_count_position]
                .meta_data
                .clone();
            state.children_count_position += 1;
            Some(meta)
        } else {
            None
        }
    }

    pub async fn reset_children_counter(&self) {
        self.core.state.lock().await.children_count_position = 0;
    }

    // ---- file lifecycle plumbing (invoked by the drive) ----

    pub async fn open_child(&self, name: &str, store: Arc<dyn ChunkStore>) -> DriveResult<()> {
        let mut state = self.core.state.lock().await;
        let executor = self.core.executor.clone();
        let child = state
            .find_mut(name)
            .ok_or_else(|| DriveError::NoSuchFile(name.to_string()))?;
        if child.is_directory() {
            return Ok(());
        }
        let count = child.open_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("opening {} open count: {}", name, count);
        if count == 1 {
            child.initialise_encryptor(store, &executor);
        }
        Ok(())
    }

    pub async fn release_child(&self, name: &str) -> DriveResult<()> {
        let mut state = self.core.state.lock().await;
        let file_delay = self.core.file_delay;
        let child = state
            .find_mut(name)
            .ok_or_else(|| DriveError::NoSuchFile(name.to_string()))?;
        if child.is_directory() {
            return Ok(());
        }
        let count = child.open_count.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("releasing {} open count: {}", name, count);
        debug_assert!(count >= 0);
        if count == 0 {
            child.schedule_deletion_of_encryptor(file_delay);
        }
        Ok(())
    }

    pub async fn flush_child(&self, name: &str) -> DriveResult<()> {
        let mut state = self.core.state.lock().await;
        let child = state
            .find_mut(name)
            .ok_or_else(|| DriveError::NoSuchFile(name.to_string()))?;
        child.flush().await
    }

    pub async fn read_child(
        &self,
        name: &str,
        buf: &mut [u8],
        offset: u64,
    ) -> DriveResult<usize> {
        let mut state = self.core.state.lock().await;
        let child = state
            .find_mut(name)
            .ok_or_else(|| DriveError::NoSuchFile(name.to_string()))?;
        child.read(buf, offset).await
    }

    pub async fn write_child(&self, name: &str, data: &[u8], offset: u64) -> DriveResult<usize> {
        let mut state = self.core.state.lock().await;
        let written = {
            let child = state
                .find_mut(name)
                .ok_or_else(|| DriveError::NoSuchFile(name.to_string()))?;
            child.write(data, offset).await?
        };
        do_schedule_for_storing(&self.core, &mut state, true);
        Ok(written)
    }

    // ---- accessors ----

    pub async fn empty(&self) -> bool {
        self.core.state.lock().await.children.is_empty()
    }

    pub async fn parent_id(&self) -> ParentId {
        self.core.state.lock().await.parent_id.clone()
    }

    pub async fn directory_id(&self) -> DirectoryId {
        self.core.state.lock().await.directory_id.clone()
    }

    pub async fn versions_count(&self) -> usize {
        self.core.state.lock().await.versions.len()
    }

    /// Retained versions, most recent first.
    pub async fn versions(&self) -> Vec<VersionName> {
        self.core
            .state
            .lock()
            .await
            .versions
            .iter()
            .cloned()
            .collect()
    }

    pub fn store_state(&self) -> StoreState {
        *self.core.store_state.borrow()
    }
}

/// Owning handle. Going out of scope forces any pending store to complete
/// synchronously; the grace period past the debounce window bounds the
/// wait, and timing out means an upstream bug lost data.
pub struct Directory {
    inner: DirectoryRef,
}

impl Deref for Directory {
    type Target = DirectoryRef;

    fn deref(&self) -> &DirectoryRef {
        &self.inner
    }
}

impl Directory {
    pub fn new(
        parent_id: ParentId,
        directory_id: DirectoryId,
        executor: TaskExecutor,
        sink: Arc<dyn DirectorySink>,
        path: PathBuf,
        config: &DriveConfig,
    ) -> Directory {
        let core = Self::build_core(
            parent_id,
            directory_id,
            Vec::new(),
            VecDeque::new(),
            config.max_versions,
            executor,
            sink,
            path,
            config,
        );
        {
            // a brand-new directory has never been stored
            let mut state = core.state.try_lock().expect("fresh directory state");
            do_schedule_for_storing(&core, &mut state, true);
        }
        Directory {
            inner: DirectoryRef { core },
        }
    }

    pub fn from_serialised(
        parent_id: ParentId,
        serialised: &[u8],
        versions: Vec<VersionName>,
        executor: TaskExecutor,
        sink: Arc<dyn DirectorySink>,
        path: PathBuf,
        config: &DriveConfig,
    ) -> DriveResult<Directory> {
        let wire: DirectoryWire = serde_json::from_slice(serialised)
            .map_err(|e| DriveError::ParsingError(format!("bad directory blob: {}", e)))?;
        let children = wire.children.into_iter().map(FileContext::with_meta).collect();
        let core = Self::build_core(
            parent_id,
            wire.directory_id,
            children,
            versions.into(),
            wire.max_versions,
            executor,
            sink,
            path,
            config,
        );
        {
            let mut state = core.state.try_lock().expect("fresh directory state");
            let weak = Arc::downgrade(&core);
            for child in state.children.iter_mut() {
                child.parent = weak.clone();
            }
            state.sort_and_reset_children_counter();
        }
        Ok(Directory {
            inner: DirectoryRef { core },
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_core(
        parent_id: ParentId,
        directory_id: DirectoryId,
        children: Vec<FileContext>,
        versions: VecDeque<VersionName>,
        max_versions: usize,
        executor: TaskExecutor,
        sink: Arc<dyn DirectorySink>,
        path: PathBuf,
        config: &DriveConfig,
    ) -> Arc<DirectoryCore> {
        Arc::new(DirectoryCore {
            state: Mutex::new(DirectoryState {
                parent_id,
                directory_id,
                timer: DeferredTask::new(executor.clone()),
                binding: StoreBinding { sink, path },
                versions,
                max_versions,
                children,
                children_count_position: 0,
            }),
            store_state: watch::channel(StoreState::Complete).0,
            executor,
            file_delay: config.file_inactivity_delay(),
            store_delay: config.directory_inactivity_delay(),
        })
    }

    pub fn directory_ref(&self) -> DirectoryRef {
        self.inner.clone()
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        let core = self.inner.core.clone();
        let wait = core.store_delay + DIRECTORY_TEARDOWN_GRACE;
        let (tx, rx) = std::sync::mpsc::channel();
        self.inner.core.executor.spawn(async move {
            {
                let mut state = core.state.lock().await;
                do_schedule_for_storing(&core, &mut state, false);
            }
            let mut state_rx = core.store_state.subscribe();
            let completed = tokio::time::timeout(
                wait,
                state_rx.wait_for(|s| *s == StoreState::Complete),
            )
            .await
            .is_ok();
            let _ = tx.send(completed);
        });
        let completed = matches!(
            rx.recv_timeout(wait + DIRECTORY_TEARDOWN_GRACE),
            Ok(true)
        );
        if !completed {
            error!("store did not complete before directory teardown");
            debug_assert!(completed, "store did not complete before directory teardown");
        }
    }
}
