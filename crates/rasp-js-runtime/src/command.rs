//! Commands sent to a worker thread.
//!
//! Shutdown travels on a separate watch channel so it is never stuck behind
//! a full command queue.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::types::RequestContext;

pub(crate) enum WorkerCommand {
    /// Evaluate one event and reply with the block decision.
    Check {
        event_type: String,
        params: Arc<serde_json::Value>,
        /// Replaces the worker's request; `None` clears it.
        request: Option<RequestContext>,
        reply: oneshot::Sender<bool>,
    },
}
