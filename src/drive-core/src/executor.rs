use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

/// Dedicated runtime servicing timer expiries and store callbacks.
///
/// At least two workers, so a store completion cannot starve a file
/// teardown timer. Shut down in the background on drop, which makes it
/// safe to drop from inside another runtime's context; owners that need
/// pending work to finish must wait for it before letting go of the
/// executor.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    runtime: Option<Runtime>,
}

impl TaskExecutor {
    pub fn new(worker_threads: usize) -> Self {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(2))
            .thread_name("drive-timer")
            .enable_all()
            .build()
            .expect("build timer runtime");
        Self {
            inner: Arc::new(ExecutorInner {
                runtime: Some(runtime),
            }),
        }
    }

    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner
            .runtime
            .as_ref()
            .expect("executor already shut down")
            .spawn(fut)
    }
}

impl Drop for ExecutorInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// One-shot deferred callback with cancellation evidence.
///
/// `cancel` (and the implicit cancel inside `arm`) returns how many
/// pending callbacks were definitely prevented from running: 1 when the
/// claim token was still unspent, 0 when the callback has already fired
/// or nothing was armed. Callers rely on a positive return as proof the
/// scheduled work did not and will not happen.
pub struct DeferredTask {
    executor: TaskExecutor,
    pending: Option<PendingFire>,
}

struct PendingFire {
    claim: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl DeferredTask {
    pub fn new(executor: TaskExecutor) -> Self {
        Self {
            executor,
            pending: None,
        }
    }

    /// Arm the task to run `fire` after `delay`, cancelling any callback
    /// armed earlier. Returns the number of callbacks cancelled.
    pub fn arm<F>(&mut self, delay: Duration, fire: F) -> usize
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancelled = self.cancel();
        let claim = Arc::new(AtomicBool::new(true));
        let fire_claim = claim.clone();
        let handle = self.executor.spawn(async move {
            tokio::time::sleep(delay).await;
            if fire_claim
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                fire.await;
            }
        });
        self.pending = Some(PendingFire { claim, handle });
        cancelled
    }

    /// Returns 1 if a pending callback was prevented from running.
    pub fn cancel(&mut self) -> usize {
        match self.pending.take() {
            Some(pending) => {
                if pending
                    .claim
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    pending.handle.abort();
                    1
                } else {
                    0
                }
            }
            None => 0,
        }
    }
}

impl Drop for DeferredTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
