//! Two-pool task executor.
//!
//! Transport work (socket I/O, codec, timers) and callback work (method
//! handlers, user callbacks) run on separate pools so a slow handler cannot
//! starve I/O. A single-threaded variant runs both kinds of work on one
//! cooperative loop, for tests and clients embedded in another runtime.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt as _;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::ExecutorConfig;
use crate::error::{Error, Result};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Which pool a piece of work belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    /// Socket I/O, parsing, timers.
    Transport,
    /// User-provided handlers and completions.
    Callback,
}

/// Requests cooperative shutdown of the tasks holding the paired
/// [`ShutdownSignal`].
#[derive(Debug)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<()>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = tokio::sync::watch::channel(());
        (Self(sender), ShutdownSignal(receiver))
    }

    pub fn signal(&self) {
        let _ = self.0.send(());
    }

    /// Resolves once every signal clone has been dropped.
    pub async fn all_closed(&self) {
        self.0.closed().await;
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<()>);

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        let _ = self.0.changed().await;
    }
}

/// Aborts the running task when dropped.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub async fn join(mut self) -> core::result::Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    pub fn abort(&self) {
        self.0.abort();
    }

    /// Drop without aborting the task.
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

struct ExecutorShared {
    transport: Handle,
    callback: Handle,
    failure: Mutex<Option<Error>>,
    interrupted: AtomicBool,
    stop_trigger: Notify,
    error_sink: Mutex<Option<Box<dyn Fn(&Error) + Send + Sync>>>,
}

impl ExecutorShared {
    fn record_failure(&self, error: Error) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                if let Some(sink) = &*self.error_sink.lock() {
                    sink(&error);
                }
                *failure = Some(error);
            }
        }
        self.stop_trigger.notify_waiters();
    }
}

/// Cheap cloneable access to the pools, used by long-lived components.
#[derive(Clone)]
pub(crate) struct ExecutorHandle {
    shared: Arc<ExecutorShared>,
}

impl ExecutorHandle {
    /// Spawn a task whose failure is fatal for the whole executor.
    ///
    /// The first `Err` (or panic) is captured, forwarded to the error sink
    /// and surfaced through [`Executor::last_error`]; it also wakes anything
    /// blocked on the stop trigger.
    pub(crate) fn spawn<F>(&self, op: OperationType, future: F) -> ChildTask<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let handle = self.runtime_handle(op);
        let task = handle.spawn(async move {
            match std::panic::AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    shared.record_failure(Error::unexpected(format!("{error:#}")));
                }
                Err(_panic) => {
                    shared.record_failure(Error::unexpected("task panicked"));
                }
            }
        });
        ChildTask(task)
    }

    pub(crate) fn runtime_handle(&self, op: OperationType) -> &Handle {
        match op {
            OperationType::Transport => &self.shared.transport,
            OperationType::Callback => &self.shared.callback,
        }
    }

    /// Resolves when a fatal failure was recorded or the executor was
    /// interrupted.
    pub(crate) async fn stop_triggered(&self) -> Option<Error> {
        loop {
            let notified = self.shared.stop_trigger.notified();
            if let Some(error) = self.shared.failure.lock().clone() {
                return Some(error);
            }
            if self.shared.interrupted.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }
}

/// Owner of the worker pools.
pub struct Executor {
    shared: Arc<ExecutorShared>,
    runtimes: Mutex<Vec<Runtime>>,
}

impl Executor {
    /// Build an executor with dedicated transport and callback pools.
    pub fn multi_thread(config: &ExecutorConfig) -> Result<Self> {
        config.validate()?;

        let transport = Self::build_runtime("mrpc-transport", config.num_transport_threads)?;
        let callback = Self::build_runtime("mrpc-callback", config.num_callback_threads)?;

        Ok(Self::from_runtimes(
            transport.handle().clone(),
            callback.handle().clone(),
            vec![transport, callback],
        ))
    }

    /// Build an executor running both operation types on one worker thread.
    pub fn single_thread() -> Result<Self> {
        let runtime = Self::build_runtime("mrpc-worker", 1)?;
        let handle = runtime.handle().clone();
        Ok(Self::from_runtimes(handle.clone(), handle, vec![runtime]))
    }

    fn build_runtime(name: &str, workers: usize) -> Result<Runtime> {
        Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name(name)
            .enable_all()
            .build()
            .map_err(|e| Error::unexpected(format!("failed to build the async runtime: {e}")))
    }

    fn from_runtimes(transport: Handle, callback: Handle, runtimes: Vec<Runtime>) -> Self {
        Self {
            shared: Arc::new(ExecutorShared {
                transport,
                callback,
                failure: Mutex::new(None),
                interrupted: AtomicBool::new(false),
                stop_trigger: Notify::new(),
                error_sink: Mutex::new(None),
            }),
            runtimes: Mutex::new(runtimes),
        }
    }

    pub(crate) fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Schedule a task on the given pool. Tasks are FIFO-ordered within a
    /// pool; only partial order holds across pools.
    pub fn spawn<F>(&self, op: OperationType, future: F) -> ChildTask<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handle().spawn(op, future)
    }

    /// Install a sink notified about the first fatal task failure.
    pub fn set_error_sink(&self, sink: impl Fn(&Error) + Send + Sync + 'static) {
        *self.shared.error_sink.lock() = Some(Box::new(sink));
    }

    /// The first fatal task failure, if any occurred so far.
    pub fn last_error(&self) -> Option<Error> {
        self.shared.failure.lock().clone()
    }

    /// Request shutdown without waiting.
    ///
    /// Safe to call from inside a task; the owner still has to call
    /// [`Executor::stop`] from outside the pools to release the threads.
    pub fn interrupt(&self) {
        self.shared.interrupted.store(true, Ordering::Release);
        self.shared.stop_trigger.notify_waiters();
    }

    /// Shut the pools down, waiting briefly for in-flight tasks.
    ///
    /// Must not be called from inside a task; use [`Executor::interrupt`]
    /// there instead.
    pub fn stop(&self) {
        let runtimes = std::mem::take(&mut *self.runtimes.lock());
        for runtime in runtimes {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop();
    }
}
