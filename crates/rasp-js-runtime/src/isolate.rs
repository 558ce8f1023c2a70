//! A runtime restored from a snapshot, with its hot handles cached.

use std::sync::Arc;

use deno_core::serde_v8;
use deno_core::v8;
use deno_core::JsRuntime;
use deno_core::RuntimeOptions;

use crate::error::EngineError;
use crate::ops::{self, BridgeState};
use crate::services::LogSink;
use crate::snapshot::SnapshotBlob;
use crate::ISOLATE_CREATE_LOCK;

/// Reserved verdict keys.
pub(crate) struct Keys {
    pub action: v8::Global<v8::String>,
    pub message: v8::Global<v8::String>,
    pub name: v8::Global<v8::String>,
    pub confidence: v8::Global<v8::String>,
}

/// Reserved action codes.
pub(crate) struct Codes {
    pub ignore: v8::Global<v8::String>,
    pub log: v8::Global<v8::String>,
    pub block: v8::Global<v8::String>,
}

/// One execution context. Owned by exactly one worker thread.
///
/// Field order matters: the globals must be released before the runtime
/// that owns their heap.
pub struct Isolate {
    pub(crate) check: v8::Global<v8::Function>,
    pub(crate) context: v8::Global<v8::Object>,
    pub(crate) keys: Keys,
    pub(crate) codes: Codes,
    pub(crate) handle: v8::IsolateHandle,
    pub(crate) runtime: JsRuntime,
}

impl Isolate {
    /// Restore from `blob`, refusing images built against another bridge.
    pub fn restore(blob: &SnapshotBlob, log: Arc<dyn LogSink>) -> Result<Self, EngineError> {
        let found = ops::fingerprint();
        if blob.bridge != found {
            return Err(EngineError::BridgeMismatch {
                expected: blob.bridge,
                found,
            });
        }

        let mut runtime = {
            let _lock = ISOLATE_CREATE_LOCK.lock();
            tracing::debug!("[isolate] Restoring from {} byte snapshot", blob.bytes.len());
            JsRuntime::new(RuntimeOptions {
                startup_snapshot: Some(blob.bytes),
                extensions: vec![ops::extension()],
                ..Default::default()
            })
        };
        runtime.op_state().borrow_mut().put(BridgeState::new(log));
        let handle = runtime.v8_isolate().thread_safe_handle();

        let (check, context, keys, codes) = {
            let scope = &mut runtime.handle_scope();
            let global = scope.get_current_context().global(scope);

            let rasp = object(scope, global, "RASP")?;
            let check = v8::Local::<v8::Function>::try_from(property(scope, rasp, "check")?)
                .map_err(|_| EngineError::Entrypoint("RASP.check is not a function".into()))?;
            let ctor = v8::Local::<v8::Function>::try_from(property(scope, rasp, "Context")?)
                .map_err(|_| EngineError::Entrypoint("RASP.Context is not a function".into()))?;
            let context = ctor
                .new_instance(scope, &[])
                .ok_or_else(|| EngineError::Entrypoint("new RASP.Context() failed".into()))?;

            let keys = Keys {
                action: global_string(scope, "action")?,
                message: global_string(scope, "message")?,
                name: global_string(scope, "name")?,
                confidence: global_string(scope, "confidence")?,
            };
            let codes = Codes {
                ignore: global_string(scope, "ignore")?,
                log: global_string(scope, "log")?,
                block: global_string(scope, "block")?,
            };

            (
                v8::Global::new(scope, check),
                v8::Global::new(scope, context),
                keys,
                codes,
            )
        };

        Ok(Self {
            check,
            context,
            keys,
            codes,
            handle,
            runtime,
        })
    }

    /// Replace the request the context getters read from.
    pub fn set_request(&mut self, fields: serde_json::Map<String, serde_json::Value>) {
        let op_state = self.runtime.op_state();
        let mut state = op_state.borrow_mut();
        if let Some(bridge) = state.try_borrow_mut::<BridgeState>() {
            bridge.request = fields;
        }
    }

    /// Sorted own property names of the global object.
    pub fn global_names(&mut self) -> Result<Vec<String>, EngineError> {
        let result = self
            .runtime
            .execute_script(
                "<rasp:globals>",
                "Object.getOwnPropertyNames(globalThis).sort()",
            )
            .map_err(|e| EngineError::Marshal(e.to_string()))?;
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, result);
        serde_v8::from_v8(scope, local).map_err(|e| EngineError::Marshal(e.to_string()))
    }

    /// Evaluate a script and return its result as JSON. For hosts and tests
    /// that need to inspect isolate state.
    pub fn eval(&mut self, source: &str) -> Result<serde_json::Value, EngineError> {
        let result = self
            .runtime
            .execute_script("<rasp:eval>", source.to_string())
            .map_err(|e| EngineError::Marshal(e.to_string()))?;
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, result);
        serde_v8::from_v8(scope, local).map_err(|e| EngineError::Marshal(e.to_string()))
    }
}

fn property<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
) -> Result<v8::Local<'s, v8::Value>, EngineError> {
    let key = v8::String::new(scope, name)
        .ok_or_else(|| EngineError::Marshal(format!("cannot allocate {:?}", name)))?;
    object
        .get(scope, key.into())
        .filter(|value| !value.is_null_or_undefined())
        .ok_or_else(|| EngineError::Entrypoint(format!("{} is not defined", name)))
}

fn object<'s>(
    scope: &mut v8::HandleScope<'s>,
    parent: v8::Local<'s, v8::Object>,
    name: &str,
) -> Result<v8::Local<'s, v8::Object>, EngineError> {
    let value = property(scope, parent, name)?;
    v8::Local::<v8::Object>::try_from(value)
        .map_err(|_| EngineError::Entrypoint(format!("{} is not an object", name)))
}

fn global_string(
    scope: &mut v8::HandleScope<'_>,
    text: &str,
) -> Result<v8::Global<v8::String>, EngineError> {
    let local = v8::String::new(scope, text)
        .ok_or_else(|| EngineError::Marshal(format!("cannot allocate {:?}", text)))?;
    Ok(v8::Global::new(scope, local))
}
