//! One evaluation call: marshal, invoke under the watchdog, interpret,
//! aggregate, emit.
//!
//! Nothing a plugin does escapes this module as an error. Every failure ends
//! as a log line and a non-blocking outcome.

use std::sync::Arc;
use std::time::Duration;

use deno_core::serde_v8;
use deno_core::v8;

use crate::isolate::{Codes, Isolate, Keys};
use crate::services::Sinks;
use crate::types::{Action, AlarmRecord, InterceptState, RequestContext, Verdict};
use crate::watchdog::Watchdog;

pub const TIMEOUT_MESSAGE: &str = "Javascript plugin execution timeout.";

/// How a call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `RASP.check` returned an array.
    Verdicts { alarms: usize, blocked: bool },
    /// Returned something other than an array.
    Malformed,
    /// Interrupted by the watchdog.
    TimedOut,
    /// Uncaught exception; message and stack.
    Threw(String),
    /// The event parameters could not be converted.
    Marshal(String),
}

impl Outcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Outcome::Verdicts { blocked: true, .. })
    }
}

enum Raw {
    Returned(Option<Vec<Verdict>>),
    Failed,
}

pub struct CheckInvoker<'a> {
    pub watchdog: &'a Watchdog,
    pub sinks: &'a Sinks,
    pub timeout: Duration,
}

impl CheckInvoker<'_> {
    pub fn invoke(
        &self,
        isolate: &mut Isolate,
        event_type: &str,
        params: &Arc<serde_json::Value>,
        request: &RequestContext,
    ) -> Outcome {
        let Isolate {
            runtime,
            check,
            context,
            keys,
            codes,
            handle,
        } = isolate;

        let (raw, fired, terminated, message) = {
            let scope = &mut runtime.handle_scope();

            let Some(ty) = v8::String::new(scope, event_type) else {
                return self.marshal_failed(event_type, "cannot allocate event type".into());
            };
            let args = match serde_v8::to_v8(scope, params.as_ref()) {
                Ok(value) => value,
                Err(e) => return self.marshal_failed(event_type, e.to_string()),
            };
            let check = v8::Local::new(scope, &*check);
            let context = v8::Local::new(scope, &*context);

            let tc = &mut v8::TryCatch::new(scope);
            let guarded = self.watchdog.guard(&*handle, self.timeout, || {
                let recv = v8::undefined(tc).into();
                match check.call(tc, recv, &[ty.into(), args, context.into()]) {
                    Some(value) => Raw::Returned(collect(tc, value, keys, codes, event_type)),
                    None => Raw::Failed,
                }
            });

            let terminated = tc.has_terminated() || tc.is_execution_terminating();
            let interrupted = guarded.fired || terminated;
            // An interrupted call yields no verdicts, even if some were read.
            let raw = if interrupted { Raw::Failed } else { guarded.value };
            let message = match raw {
                Raw::Failed if !interrupted => exception_detail(tc),
                _ => None,
            };
            (raw, guarded.fired, terminated, message)
        };

        if fired || terminated {
            handle.cancel_terminate_execution();
        }

        match raw {
            Raw::Failed => match message {
                Some(detail) => {
                    tracing::warn!("[invoker] Plugin threw during {} check", event_type);
                    self.sinks.log.log(&detail);
                    Outcome::Threw(detail)
                }
                None => {
                    tracing::warn!(
                        "[invoker] {} check exceeded {} ms",
                        event_type,
                        self.timeout.as_millis()
                    );
                    let notice = serde_json::json!({
                        "message": TIMEOUT_MESSAGE,
                        "type": event_type,
                        "params": params.as_ref(),
                        "context": request,
                    });
                    self.sinks.log.log(&notice.to_string());
                    Outcome::TimedOut
                }
            },
            Raw::Returned(None) => {
                tracing::debug!("[invoker] {} check returned a non-array", event_type);
                Outcome::Malformed
            }
            Raw::Returned(Some(verdicts)) => {
                let mut blocked = false;
                let alarms = verdicts.len();
                for verdict in verdicts {
                    blocked |= verdict.intercept_state.action.is_blocking();
                    self.sinks.alarm.alarm(AlarmRecord::from_verdict(verdict, params));
                }
                Outcome::Verdicts { alarms, blocked }
            }
        }
    }

    fn marshal_failed(&self, event_type: &str, detail: String) -> Outcome {
        tracing::warn!("[invoker] Failed to marshal {} params: {}", event_type, detail);
        Outcome::Marshal(detail)
    }
}

/// Interpret a returned value. `None` when it is not an array.
fn collect<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
    keys: &Keys,
    codes: &Codes,
    event_type: &str,
) -> Option<Vec<Verdict>> {
    let array = v8::Local::<v8::Array>::try_from(value).ok()?;

    let key_action = v8::Local::new(scope, &keys.action);
    let key_message = v8::Local::new(scope, &keys.message);
    let key_name = v8::Local::new(scope, &keys.name);
    let key_confidence = v8::Local::new(scope, &keys.confidence);
    let ignore = v8::Local::new(scope, &codes.ignore);
    let log = v8::Local::new(scope, &codes.log);
    let block = v8::Local::new(scope, &codes.block);

    let mut verdicts = Vec::new();
    for i in 0..array.length() {
        if scope.is_execution_terminating() {
            break;
        }
        let Some(item) = array.get_index(scope, i) else {
            continue;
        };
        let Ok(item) = v8::Local::<v8::Object>::try_from(item) else {
            continue;
        };
        let Some(action) = item.get(scope, key_action.into()) else {
            continue;
        };
        if !action.is_string() || action.strict_equals(ignore.into()) {
            continue;
        }

        let kind = if action.strict_equals(block.into()) {
            Action::Block
        } else if action.strict_equals(log.into()) {
            Action::Log
        } else {
            Action::Other
        };

        let message = item.get(scope, key_message.into());
        let name = item.get(scope, key_name.into());
        let confidence = item
            .get(scope, key_confidence.into())
            .and_then(|v| v.int32_value(scope))
            .unwrap_or(0);

        verdicts.push(Verdict {
            attack_type: event_type.to_string(),
            intercept_state: InterceptState::with_action(action.to_rust_string_lossy(scope), kind),
            message: text(scope, message),
            name: text(scope, name),
            confidence,
        });
    }
    Some(verdicts)
}

fn text<'s>(scope: &mut v8::HandleScope<'s>, value: Option<v8::Local<'s, v8::Value>>) -> String {
    match value {
        Some(v) if !v.is_null_or_undefined() => v.to_rust_string_lossy(scope),
        _ => String::new(),
    }
}

/// Message, location and stack of the caught exception, if there is one.
fn exception_detail(tc: &mut v8::TryCatch<v8::HandleScope>) -> Option<String> {
    let message = tc.message()?;
    let mut detail = message.get(tc).to_rust_string_lossy(tc);

    let resource = message
        .get_script_resource_name(tc)
        .map(|name| name.to_rust_string_lossy(tc));
    if let (Some(resource), Some(line)) = (resource, message.get_line_number(tc)) {
        detail = format!("{}:{}\n{}", resource, line, detail);
    }

    if let Some(stack) = tc.stack_trace() {
        let stack = stack.to_rust_string_lossy(tc);
        if !stack.is_empty() {
            detail.push('\n');
            detail.push_str(&stack);
        }
    }
    Some(detail)
}
