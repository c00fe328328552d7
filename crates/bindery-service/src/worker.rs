//! The single worker that owns all session state.
//!
//! Entry points never touch the [`SessionRegistry`] directly. They box a
//! closure, push it onto a bounded queue, and the worker runs closures one
//! at a time on a dedicated blocking thread. Callbacks fired from inside a
//! closure may enqueue more work but must not wait for it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bindery_session::SessionRegistry;
use bindery_types::OsAccountId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::router::CallbackRouter;
use crate::ServiceError;

type Job = Box<dyn FnOnce(&mut Worker) + Send>;

pub(crate) enum Command {
    Run(Job),
    Shutdown,
}

/// State owned by the worker thread.
pub(crate) struct Worker {
    pub(crate) registry: SessionRegistry,
    pub(crate) callbacks: Arc<CallbackRouter>,
    pub(crate) default_os: OsAccountId,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        tracing::info!("session worker started");
        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Run(job) => {
                    if catch_unwind(AssertUnwindSafe(|| job(&mut self))).is_err() {
                        tracing::error!("worker task panicked");
                    }
                }
                Command::Shutdown => break,
            }
        }
        let live = self.registry.len();
        self.registry.destroy_all();
        tracing::info!(live_sessions = live, "session worker stopped");
    }

    /// Resolves a caller-supplied account id, negative meaning the default.
    pub(crate) fn os_account(&self, os: OsAccountId) -> OsAccountId {
        if os < 0 {
            self.default_os
        } else {
            os
        }
    }
}

/// Sending half of the worker queue.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    tx: mpsc::Sender<Command>,
}

impl WorkerHandle {
    /// Starts the worker on the blocking pool. Must be called from inside a
    /// tokio runtime.
    pub(crate) fn spawn(worker: Worker, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let task = tokio::task::spawn_blocking(move || worker.run(rx));
        (Self { tx }, task)
    }

    fn enqueue(&self, command: Command) -> Result<(), ServiceError> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!("worker queue full, rejecting request");
                ServiceError::Busy
            }
            mpsc::error::TrySendError::Closed(_) => ServiceError::ShutDown,
        })
    }

    /// Queues `f` without waiting for it to run.
    pub(crate) fn post<F>(&self, f: F) -> Result<(), ServiceError>
    where
        F: FnOnce(&mut Worker) + Send + 'static,
    {
        self.enqueue(Command::Run(Box::new(f)))
    }

    /// Queues `f` and waits for its result.
    pub(crate) async fn call<F, R>(&self, f: F) -> Result<R, ServiceError>
    where
        F: FnOnce(&mut Worker) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(move |worker| {
            let _ = reply_tx.send(f(worker));
        })?;
        reply_rx.await.map_err(|_| ServiceError::ShutDown)
    }

    /// Asks the worker to stop after the commands already queued.
    pub(crate) async fn shutdown(&self) {
        if self.tx.send(Command::Shutdown).await.is_err() {
            tracing::debug!("worker already stopped");
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
