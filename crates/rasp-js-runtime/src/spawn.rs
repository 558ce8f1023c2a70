//! Spawning worker threads.
//!
//! Each worker runs in its own OS thread with a current-thread tokio runtime
//! driving its command loop, and owns exactly one [`Worker`].

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::command::WorkerCommand;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::handle::WorkerHandle;
use crate::worker::Worker;

/// Start a worker thread for `engine`.
///
/// Returns once the thread has restored its isolate (or found checks
/// disabled).
pub fn spawn_worker(name: impl Into<String>, engine: &Engine) -> Result<WorkerHandle, EngineError> {
    let name = name.into();
    tracing::debug!("[spawn_worker] Starting {}", name);

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<bool>(1);

    let engine = engine.clone();
    let name_clone = name.clone();
    let thread_handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || -> Result<(), EngineError> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(EngineError::SpawnFailed)?;

            let mut worker = Worker::new(&engine);
            let _ = init_tx.send(worker.initialize());

            rt.block_on(run_worker(&name_clone, &mut worker, cmd_rx, shutdown_rx));

            drop(worker);
            rt.shutdown_background();
            tracing::debug!("[spawn_worker:{}] Thread exiting", name_clone);
            Ok(())
        })
        .map_err(EngineError::SpawnFailed)?;

    let enabled = init_rx.recv().map_err(|_| EngineError::WorkerClosed)?;
    tracing::debug!("[spawn_worker] {} is ready (enabled: {})", name, enabled);

    Ok(WorkerHandle {
        name,
        cmd_tx,
        shutdown_tx,
        closed: Arc::new(AtomicBool::new(false)),
        thread_handle: Mutex::new(Some(thread_handle)),
    })
}

async fn run_worker(
    name: &str,
    worker: &mut Worker,
    mut cmd_rx: mpsc::Receiver<WorkerCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            tracing::debug!("[run_worker:{}] Shutdown signal received", name);
            break;
        }

        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("[run_worker:{}] Shutdown signal received", name);
                    break;
                }
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!("[run_worker:{}] Command channel closed", name);
                    break;
                };
                match cmd {
                    WorkerCommand::Check { event_type, params, request, reply } => {
                        worker.set_request(request.unwrap_or_default());
                        let blocked = worker.check(&event_type, params);
                        let _ = reply.send(blocked);
                    }
                }
            }
        }
    }
    worker.teardown();
}
