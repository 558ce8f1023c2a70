//! Host services the engine reports into.
//!
//! The engine never stores or ships alarms itself. It hands each record to an
//! [`AlarmSink`] and every plugin diagnostic to a [`LogSink`]; both are shared
//! across worker threads.

use std::sync::Arc;

use crate::types::AlarmRecord;

/// Receives one record per non-ignored verdict.
pub trait AlarmSink: Send + Sync + 'static {
    fn alarm(&self, record: AlarmRecord);
}

/// Receives free-text plugin diagnostics: `console.*` output, compile
/// errors, runtime exceptions and timeout notices.
pub trait LogSink: Send + Sync + 'static {
    fn log(&self, line: &str);
}

/// Default alarm sink: one `warn!` event per alarm.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlarmSink;

impl AlarmSink for TracingAlarmSink {
    fn alarm(&self, record: AlarmRecord) {
        tracing::warn!(
            target: "rasp::alarm",
            attack_type = %record.attack_type,
            intercept_state = %record.intercept_state.raw,
            plugin_name = %record.plugin_name,
            plugin_confidence = record.plugin_confidence,
            "{}",
            record.plugin_message
        );
    }
}

/// Default log sink: plugin output at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, line: &str) {
        tracing::info!(target: "rasp::plugin", "{}", line);
    }
}

/// The pair of sinks an engine reports into.
#[derive(Clone)]
pub struct Sinks {
    pub alarm: Arc<dyn AlarmSink>,
    pub log: Arc<dyn LogSink>,
}

impl Default for Sinks {
    fn default() -> Self {
        Self {
            alarm: Arc::new(TracingAlarmSink),
            log: Arc::new(TracingLogSink),
        }
    }
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks").finish_non_exhaustive()
    }
}
