//! A background event loop owned by a dedicated thread.
//!
//! Synchronous callers hand futures to the loop and either block on the
//! result ([`AsyncWorker::run_task`]) or detach them ([`AsyncWorker::spawn`]).
//! [`AsyncWorker::stop`] cancels outstanding tasks, waits for them, and joins
//! the thread.

use crate::error::SyncError;
use parking_lot::Mutex;
use std::future::Future;
use std::thread::JoinHandle as ThreadHandle;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type TaskResult = Result<(), SyncError>;

pub struct AsyncWorker {
    handle: Handle,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<TaskResult>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<ThreadHandle<()>>>,
}

impl AsyncWorker {
    /// Start the loop thread and wait until its runtime is ready.
    pub fn start(name: &str) -> Result<Self, SyncError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })
            .map_err(|e| SyncError::Worker(e.to_string()))?;

        let handle = ready_rx
            .recv()
            .map_err(|e| SyncError::Worker(e.to_string()))?
            .map_err(SyncError::Worker)?;
        debug!(worker = name, "async worker started");
        Ok(Self {
            handle,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Token cancelled by [`AsyncWorker::stop`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `future` on the loop and block the calling thread until it
    /// finishes or the worker is stopped. Must not be called from the loop.
    pub fn run_task<F, T>(&self, future: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cancel = self.cancel.clone();
        self.handle.spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(SyncError::Cancelled),
                out = future => out,
            };
            let _ = tx.send(result);
        });
        rx.blocking_recv().map_err(|_| SyncError::Cancelled)?
    }

    /// Detach `future` on the loop. Its error, if any, surfaces from `stop`.
    /// The future is polled ahead of the cancel check, so a task watching
    /// [`cancel_token`](Self::cancel_token) itself gets to finish its exit path.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let task = self.handle.spawn(async move {
            tokio::select! {
                biased;
                out = future => out,
                _ = cancel.cancelled() => Ok(()),
            }
        });
        self.tasks.lock().push(task);
    }

    /// Cancel all tasks, wait for them, and join the loop thread. Returns the
    /// first task error.
    pub fn stop(&self) -> Result<(), SyncError> {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        let mut first_error = None;
        for task in tasks {
            let outcome = match join_task(&self.handle, task) {
                Ok(result) => result,
                Err(e) => Err(SyncError::Worker(e)),
            };
            if let Err(e) = outcome {
                warn!(error = %e, "worker task failed");
                first_error.get_or_insert(e);
            }
        }
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.lock().take() {
            thread
                .join()
                .map_err(|_| SyncError::Worker("loop thread panicked".into()))?;
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for AsyncWorker {
    fn drop(&mut self) {
        if self.thread.lock().is_some() {
            let _ = self.stop();
        }
    }
}

/// Wait for a loop task from outside the loop.
fn join_task(handle: &Handle, task: JoinHandle<TaskResult>) -> Result<TaskResult, String> {
    let (tx, rx) = oneshot::channel();
    handle.spawn(async move {
        let _ = tx.send(task.await.map_err(|e| e.to_string()));
    });
    rx.blocking_recv().map_err(|e| e.to_string())?
}
