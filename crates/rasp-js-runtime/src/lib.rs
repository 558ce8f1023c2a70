//! RASP JavaScript Runtime
//!
//! Evaluates detection plugins against intercepted application events and
//! turns their output into a block decision plus alarm records.
//!
//! # Architecture
//!
//! - Plugins are read from `<root>/plugins` and booted once, together with
//!   the bundled scripts, into a V8 snapshot
//! - Each worker thread restores its own isolate from that snapshot; no
//!   isolate is ever shared or locked
//! - Every check runs under a watchdog that terminates runaway plugin code
//! - Plugin failures never reach the host: a check always yields a boolean,
//!   with alarms and diagnostics going to the host sinks

mod command;
mod config;
mod engine;
mod error;
mod handle;
mod invoker;
mod isolate;
mod ops;
mod registry;
mod services;
mod snapshot;
mod spawn;
pub mod sql;
mod types;
mod watchdog;
mod worker;

use std::sync::Once;

use deno_core::JsRuntime;

pub use config::{plugin_dir, EngineConfig, MAX_PLUGIN_SIZE};
pub use engine::{Engine, EngineStatus};
pub use error::{EngineError, SnapshotError};
pub use handle::WorkerHandle;
pub use invoker::{Outcome, TIMEOUT_MESSAGE};
pub use isolate::Isolate;
pub use ops::{fingerprint, install_script, BridgeFingerprint, NativeFunction, NATIVE_BRIDGE};
pub use registry::{load as load_plugins, PluginSource};
pub use services::{AlarmSink, LogSink, Sinks, TracingAlarmSink, TracingLogSink};
pub use snapshot::{SnapshotBlob, SnapshotBuilder, BOOTSTRAP_SCRIPTS};
pub use spawn::spawn_worker;
pub use types::{Action, AlarmRecord, InterceptState, RequestContext, Verdict};
pub use watchdog::{Guarded, Interrupt, Watchdog};
pub use worker::{IsolateSlot, Worker};

/// Ensure V8 platform is initialized exactly once.
static V8_INIT: Once = Once::new();

/// Serializes V8 isolate creation (snapshot builds and restores).
pub(crate) static ISOLATE_CREATE_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Initialize the V8 platform. Call this before creating any engine.
/// Safe to call multiple times - will only initialize once.
pub fn init_platform() {
    V8_INIT.call_once(|| {
        JsRuntime::init_platform(None, false);
    });
}
