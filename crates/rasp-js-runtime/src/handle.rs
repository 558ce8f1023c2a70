//! Handle to a worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::command::WorkerCommand;
use crate::error::EngineError;
use crate::types::RequestContext;

/// Handle to a spawned worker.
///
/// Dropping the handle shuts the worker down and joins its thread.
pub struct WorkerHandle {
    pub(crate) name: String,
    pub(crate) cmd_tx: mpsc::Sender<WorkerCommand>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) closed: Arc<AtomicBool>,
    pub(crate) thread_handle: Mutex<Option<thread::JoinHandle<Result<(), EngineError>>>>,
}

impl WorkerHandle {
    fn command(
        &self,
        event_type: &str,
        params: serde_json::Value,
        request: Option<RequestContext>,
    ) -> Result<(WorkerCommand, oneshot::Receiver<bool>), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::WorkerClosed);
        }
        let (reply, reply_rx) = oneshot::channel();
        let cmd = WorkerCommand::Check {
            event_type: event_type.to_string(),
            params: Arc::new(params),
            request,
            reply,
        };
        Ok((cmd, reply_rx))
    }

    /// Evaluate one event on the worker thread.
    pub async fn check(
        &self,
        event_type: &str,
        params: serde_json::Value,
        request: Option<RequestContext>,
    ) -> Result<bool, EngineError> {
        let (cmd, reply_rx) = self.command(event_type, params, request)?;
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::WorkerClosed)?;
        reply_rx.await.map_err(|_| EngineError::WorkerClosed)
    }

    /// Blocking variant of [`check`](Self::check). Must not be called from
    /// inside an async runtime.
    pub fn check_blocking(
        &self,
        event_type: &str,
        params: serde_json::Value,
        request: Option<RequestContext>,
    ) -> Result<bool, EngineError> {
        let (cmd, reply_rx) = self.command(event_type, params, request)?;
        self.cmd_tx
            .blocking_send(cmd)
            .map_err(|_| EngineError::WorkerClosed)?;
        reply_rx.blocking_recv().map_err(|_| EngineError::WorkerClosed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to exit after its current command. Queued commands
    /// are dropped and their callers see [`EngineError::WorkerClosed`].
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shut down and wait for the thread to finish.
    pub fn join(self) -> Result<(), EngineError> {
        self.shutdown();
        if let Some(handle) = self.thread_handle.lock().take() {
            handle.join().map_err(|_| EngineError::ThreadPanic)??;
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
    }
}
