use chunk_store::ChunkStore;
use log::{debug, warn};
use self_encrypt::SelfEncryptor;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::directory::DirectoryCore;
use crate::{DeferredTask, DriveError, DriveResult, MetaData, TaskExecutor};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One file or subdirectory entry within its parent directory.
///
/// Open files hold a live encryptor session plus the one-shot timer that
/// tears it down after the inactivity delay. The open count is atomic and
/// shared with the teardown callback; every other field is only touched
/// under the parent directory's lock.
pub struct FileContext {
    pub meta_data: MetaData,
    pub(crate) self_encryptor: Option<SelfEncryptor>,
    pub(crate) timer: Option<DeferredTask>,
    pub(crate) open_count: Arc<AtomicI64>,
    pub(crate) parent: Weak<DirectoryCore>,
    /// Transient marker owned by the directory's serialise pass.
    pub(crate) flushed: bool,
    /// Stable identity surviving renames, so timer callbacks can re-find
    /// this entry under the parent lock.
    context_id: u64,
}

impl FileContext {
    pub fn new(name: impl Into<String>, is_directory: bool) -> Self {
        let meta_data = if is_directory {
            MetaData::new_directory(name)
        } else {
            MetaData::new_file(name)
        };
        Self::with_meta(meta_data)
    }

    pub fn with_meta(meta_data: MetaData) -> Self {
        Self {
            meta_data,
            self_encryptor: None,
            timer: None,
            open_count: Arc::new(AtomicI64::new(0)),
            parent: Weak::new(),
            flushed: false,
            context_id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    pub fn is_directory(&self) -> bool {
        self.meta_data.is_directory()
    }

    pub fn open_count(&self) -> i64 {
        self.open_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_open_count(&self, count: i64) {
        self.open_count.store(count, Ordering::SeqCst);
    }

    /// Ensure a live encryptor session, reusing the existing one when its
    /// pending teardown can still be defused.
    ///
    /// Cancelling the armed teardown timer with a positive count proves
    /// the teardown callback has not run, so the encryptor (and any
    /// plaintext it still buffers) is intact and must not be replaced.
    pub(crate) fn initialise_encryptor(
        &mut self,
        store: Arc<dyn ChunkStore>,
        executor: &TaskExecutor,
    ) {
        debug_assert!(self.open_count() <= 1);
        match self.timer.as_mut() {
            None => self.timer = Some(DeferredTask::new(executor.clone())),
            Some(timer) => {
                if timer.cancel() > 0 {
                    debug!(
                        "defused teardown of {}, reusing live encryptor",
                        self.meta_data.name
                    );
                    debug_assert!(self.self_encryptor.is_some());
                    return;
                }
            }
        }
        let data_map = self.meta_data.data_map().cloned().unwrap_or_default();
        self.self_encryptor = Some(SelfEncryptor::new(data_map, store));
    }

    /// Arm the teardown timer. On expiry, if the file is still closed,
    /// the parent flushes and drops the encryptor.
    pub(crate) fn schedule_deletion_of_encryptor(&mut self, delay: Duration) {
        let parent = self.parent.clone();
        let open_count = self.open_count.clone();
        let context_id = self.context_id;
        let name = self.meta_data.name.clone();
        let timer = self
            .timer
            .as_mut()
            .expect("released file without teardown timer");
        let cancelled = timer.arm(delay, async move {
            if open_count.load(Ordering::SeqCst) != 0 {
                warn!("not deleting encryptor for {}: reopened", name);
                return;
            }
            if let Some(dir) = parent.upgrade() {
                debug!("deleting encryptor for {}", name);
                dir.flush_child_and_delete_encryptor(context_id).await;
            }
        });
        if cancelled > 0 {
            debug_assert_eq!(cancelled, 1);
            debug!("re-armed encryptor teardown for {}", self.meta_data.name);
        }
    }

    pub(crate) async fn read(&mut self, buf: &mut [u8], offset: u64) -> DriveResult<usize> {
        let encryptor = self.self_encryptor.as_mut().ok_or_else(|| {
            DriveError::Unknown(format!("{} has no open encryptor", self.meta_data.name))
        })?;
        encryptor
            .read(buf, offset)
            .await
            .map_err(|e| DriveError::Unknown(e.to_string()))
    }

    pub(crate) async fn write(&mut self, data: &[u8], offset: u64) -> DriveResult<usize> {
        let encryptor = self.self_encryptor.as_mut().ok_or_else(|| {
            DriveError::Unknown(format!("{} has no open encryptor", self.meta_data.name))
        })?;
        encryptor
            .write(data, offset)
            .await
            .map_err(|e| DriveError::Unknown(e.to_string()))?;
        self.meta_data.update_size(offset + data.len() as u64);
        Ok(data.len())
    }

    /// Flush the encryptor if one is live; a closed-and-flushed file is a
    /// no-op.
    pub(crate) async fn flush(&mut self) -> DriveResult<()> {
        if let Some(encryptor) = self.self_encryptor.as_mut() {
            encryptor
                .flush()
                .await
                .map_err(|e| DriveError::Unknown(e.to_string()))?;
            self.meta_data.set_data_map(encryptor.data_map().clone());
        }
        Ok(())
    }
}

impl Drop for FileContext {
    fn drop(&mut self) {
        let Some(mut timer) = self.timer.take() else {
            return;
        };
        timer.cancel();
        // One last flush so buffered bytes still reach the store. The
        // parent runs it under its lock and this thread waits for it.
        if let Some(encryptor) = self.self_encryptor.take() {
            if let Some(parent) = self.parent.upgrade() {
                parent.flush_departing_encryptor(self.meta_data.name.clone(), encryptor);
            } else {
                warn!(
                    "dropping {} after its directory went away; buffered bytes lost",
                    self.meta_data.name
                );
            }
        }
    }
}
