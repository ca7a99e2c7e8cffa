//! Delayed work for debounced persistence.
//!
//! A [`WorkItem`] is a one-shot job that can be run, cancelled or flushed by
//! whoever gets to it first. Strategies hand work items to a [`Scheduler`]
//! and keep a clone so they can cancel or flush it early.
//!
//! [`LiveScheduler`] runs timers on a dedicated thread driving a
//! current-thread tokio runtime, so callers never need to be inside a runtime
//! themselves.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tether_core::{Result, TetherError};
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send>;

/// One-shot unit of deferred work.
#[derive(Clone)]
pub struct WorkItem {
    job: Arc<Mutex<Option<Job>>>,
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl WorkItem {
    /// Wrap a job.
    pub fn new(job: impl FnOnce() + Send + 'static) -> Self {
        Self {
            job: Arc::new(Mutex::new(Some(Box::new(job)))),
        }
    }

    /// Run the job if nobody has run or cancelled it yet.
    pub fn run(&self) -> bool {
        let job = self.job.lock().take();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Discard the job. Returns whether it was still pending.
    pub fn cancel(&self) -> bool {
        self.job.lock().take().is_some()
    }

    /// Whether the job has neither run nor been cancelled.
    pub fn is_pending(&self) -> bool {
        self.job.lock().is_some()
    }
}

/// Runs work items after a delay.
pub trait Scheduler: Send + Sync {
    /// Run `work` once `delay` has elapsed, unless it is cancelled first.
    fn schedule_after(&self, delay: Duration, work: WorkItem);
}

struct SchedulerThread {
    handle: tokio::runtime::Handle,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SchedulerThread {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.lock().take() {
            // Dropped from one of our own timers: the thread exits on its own.
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

/// Wall-clock scheduler backed by a dedicated timer thread.
#[derive(Clone)]
pub struct LiveScheduler {
    inner: Arc<SchedulerThread>,
}

impl fmt::Debug for LiveScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveScheduler").finish_non_exhaustive()
    }
}

impl LiveScheduler {
    /// Start the timer thread.
    pub fn new() -> Result<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("tether-scheduler".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        let _ = handle_tx.send(Err(error));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })?;
        let handle = handle_rx
            .recv()
            .map_err(|_| TetherError::internal("scheduler thread exited during startup"))??;
        tracing::debug!("scheduler thread started");
        Ok(Self {
            inner: Arc::new(SchedulerThread {
                handle,
                shutdown: Mutex::new(Some(shutdown_tx)),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }
}

impl Scheduler for LiveScheduler {
    fn schedule_after(&self, delay: Duration, work: WorkItem) {
        self.inner.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            work.run();
        });
    }
}
