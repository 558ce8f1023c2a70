//! Error types for the evaluation engine.
//!
//! None of these ever reach a host `check()` call: plugin failures are
//! contained by the invoker and turned into log lines.

use crate::ops::BridgeFingerprint;

/// Errors raised while building or restoring runtime state.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Native bridge mismatch: snapshot built with {expected:?}, runtime has {found:?}")]
    BridgeMismatch {
        expected: BridgeFingerprint,
        found: BridgeFingerprint,
    },

    #[error("Entrypoint not found: {0}")]
    Entrypoint(String),

    #[error("Failed to marshal value: {0}")]
    Marshal(String),

    #[error("Worker has shut down")]
    WorkerClosed,

    #[error("Worker thread panicked")]
    ThreadPanic,

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(std::io::Error),
}

/// Errors from snapshot construction. Any of these disables the engine.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("bootstrap script {script} failed: {message}")]
    Bootstrap {
        script: &'static str,
        message: String,
    },

    #[error("native bridge install failed: {0}")]
    Install(String),

    #[error("snapshot image is empty")]
    Empty,
}
