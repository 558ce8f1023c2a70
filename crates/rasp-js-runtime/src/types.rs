//! Typed structures crossing the engine boundary.
//!
//! Request contexts go into scripts through the native bridge; verdicts come
//! out of `RASP.check` and are turned into alarm records for the host.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Verdicts
// ─────────────────────────────────────────────────────────────────────────────

/// Classification of a verdict's `action` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Ignore,
    Log,
    Block,
    /// Any string other than the three reserved codes. Still alarmed.
    Other,
}

impl Action {
    /// Decode an action string. Only exact matches classify.
    pub fn classify(raw: &str) -> Self {
        match raw {
            "ignore" => Action::Ignore,
            "log" => Action::Log,
            "block" => Action::Block,
            _ => Action::Other,
        }
    }

    pub fn is_blocking(self) -> bool {
        self == Action::Block
    }
}

/// The raw action string a plugin returned, plus its classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct InterceptState {
    pub raw: String,
    #[serde(skip)]
    pub action: Action,
}

impl InterceptState {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let action = Action::classify(&raw);
        Self { raw, action }
    }

    pub(crate) fn with_action(raw: String, action: Action) -> Self {
        Self { raw, action }
    }
}

/// One detection result for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub attack_type: String,
    pub intercept_state: InterceptState,
    pub message: String,
    pub name: String,
    pub confidence: i32,
}

/// What the host alarm sink receives per non-ignored verdict.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmRecord {
    pub attack_type: String,
    pub intercept_state: InterceptState,
    pub plugin_message: String,
    pub plugin_name: String,
    pub plugin_confidence: i32,
    /// Shared by every alarm raised from the same call.
    pub attack_params: Arc<serde_json::Value>,
}

impl AlarmRecord {
    pub fn from_verdict(verdict: Verdict, params: &Arc<serde_json::Value>) -> Self {
        Self {
            attack_type: verdict.attack_type,
            intercept_state: verdict.intercept_state,
            plugin_message: verdict.message,
            plugin_name: verdict.name,
            plugin_confidence: verdict.confidence,
            attack_params: Arc::clone(params),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.intercept_state.action.is_blocking()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request context
// ─────────────────────────────────────────────────────────────────────────────

/// The ambient HTTP request a check runs under.
///
/// Scripts see these fields through getters on `context`
/// (`context.url`, `context.remoteAddr`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestContext {
    pub url: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub querystring: Option<String>,
    pub protocol: Option<String>,
    pub remote_addr: Option<String>,
    pub header: serde_json::Map<String, serde_json::Value>,
    pub parameter: serde_json::Map<String, serde_json::Value>,
    pub body: Option<String>,
    pub server: serde_json::Map<String, serde_json::Value>,
}

impl RequestContext {
    /// Field view keyed by the script-facing names.
    pub(crate) fn to_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}
