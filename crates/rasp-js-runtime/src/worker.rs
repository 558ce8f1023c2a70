//! Per-thread isolate ownership.
//!
//! A [`Worker`] lazily restores its isolate from the engine's snapshot on the
//! first check and keeps it until teardown, a reload, or a timeout with
//! `rebuild_isolate_on_timeout` set. It is `!Send`: exactly one thread ever
//! touches its isolate.

use std::sync::Arc;

use crate::engine::{Engine, EngineState, Shared};
use crate::invoker::{CheckInvoker, Outcome};
use crate::isolate::Isolate;
use crate::types::RequestContext;

pub enum IsolateSlot {
    Uninitialized,
    /// No usable snapshot for this generation; checks return `false`.
    Disabled { generation: u64 },
    Ready { isolate: Box<Isolate>, generation: u64 },
}

pub struct Worker {
    shared: Arc<Shared>,
    slot: IsolateSlot,
    request: RequestContext,
}

impl Worker {
    pub fn new(engine: &Engine) -> Self {
        Self {
            shared: Arc::clone(engine.shared()),
            slot: IsolateSlot::Uninitialized,
            request: RequestContext::default(),
        }
    }

    /// Restore the isolate if needed. Returns whether checks are enabled.
    pub fn initialize(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        let state = shared.read();
        self.initialize_with(&state)
    }

    fn initialize_with(&mut self, state: &EngineState) -> bool {
        match &self.slot {
            IsolateSlot::Ready { generation, .. } if *generation == state.generation => {
                return true;
            }
            IsolateSlot::Disabled { generation } if *generation == state.generation => {
                return false;
            }
            _ => {}
        }
        self.teardown();

        let generation = state.generation;
        let Some(blob) = state.blob.as_ref() else {
            self.slot = IsolateSlot::Disabled { generation };
            return false;
        };

        match Isolate::restore(blob, Arc::clone(&self.shared.sinks.log)) {
            Ok(mut isolate) => {
                isolate.set_request(self.request.to_fields());
                tracing::debug!("[worker] Isolate ready for generation {}", generation);
                self.slot = IsolateSlot::Ready {
                    isolate: Box::new(isolate),
                    generation,
                };
                true
            }
            Err(e) => {
                tracing::error!("[worker] Isolate restore failed: {}", e);
                self.slot = IsolateSlot::Disabled { generation };
                false
            }
        }
    }

    /// Set the request subsequent checks run under.
    pub fn set_request(&mut self, request: RequestContext) {
        if let IsolateSlot::Ready { isolate, .. } = &mut self.slot {
            isolate.set_request(request.to_fields());
        }
        self.request = request;
    }

    /// Evaluate one event. `true` means block.
    pub fn check(&mut self, event_type: &str, params: impl Into<Arc<serde_json::Value>>) -> bool {
        self.check_outcome(event_type, params)
            .is_some_and(|outcome| outcome.is_blocked())
    }

    /// Like [`check`](Self::check), reporting how the call ended. `None` when
    /// checks are disabled.
    pub fn check_outcome(
        &mut self,
        event_type: &str,
        params: impl Into<Arc<serde_json::Value>>,
    ) -> Option<Outcome> {
        let shared = Arc::clone(&self.shared);
        let state = shared.read();
        if !self.initialize_with(&state) {
            return None;
        }
        let IsolateSlot::Ready { isolate, .. } = &mut self.slot else {
            return None;
        };

        let params = params.into();
        let invoker = CheckInvoker {
            watchdog: &shared.watchdog,
            sinks: &shared.sinks,
            timeout: shared.config.timeout(),
        };
        let outcome = invoker.invoke(isolate, event_type, &params, &self.request);

        if outcome == Outcome::TimedOut && shared.config.rebuild_isolate_on_timeout {
            tracing::debug!("[worker] Discarding isolate after timeout");
            self.teardown();
        }
        Some(outcome)
    }

    /// Direct access to the isolate, restoring it first if needed.
    pub fn isolate(&mut self) -> Option<&mut Isolate> {
        self.initialize();
        match &mut self.slot {
            IsolateSlot::Ready { isolate, .. } => Some(&mut **isolate),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.slot, IsolateSlot::Ready { .. })
    }

    pub fn slot(&self) -> &IsolateSlot {
        &self.slot
    }

    /// Drop the isolate. Safe to call at any time.
    pub fn teardown(&mut self) {
        if let IsolateSlot::Ready { .. } = self.slot {
            tracing::debug!("[worker] Tearing down isolate");
        }
        self.slot = IsolateSlot::Uninitialized;
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.teardown();
    }
}
