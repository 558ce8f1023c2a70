//! Native bridge for plugin scripts.
//!
//! Ops are the only way script code reaches the host. They are exposed to
//! scripts as the frozen global `__rasp_native`, generated from
//! [`NATIVE_BRIDGE`]. The snapshot builder and the isolate restore path both
//! go through [`extension`], and every snapshot records the
//! [`BridgeFingerprint`] it was built with so a restore against a different
//! table fails fast.

use std::sync::Arc;

use deno_core::op2;
use deno_core::OpState;

use crate::services::LogSink;
use crate::sql;

/// A script-visible native function and the op backing it.
#[derive(Debug, Clone, Copy)]
pub struct NativeFunction {
    /// Property name on `__rasp_native`.
    pub name: &'static str,
    /// Op name under `Deno.core.ops`.
    pub op: &'static str,
}

/// The bridge table. Order matters: it is part of the fingerprint.
pub const NATIVE_BRIDGE: &[NativeFunction] = &[
    NativeFunction {
        name: "log",
        op: "op_rasp_log",
    },
    NativeFunction {
        name: "tokenize",
        op: "op_rasp_sql_tokenize",
    },
    NativeFunction {
        name: "request",
        op: "op_rasp_request_get",
    },
];

/// Per-isolate services stored in `OpState`.
pub struct BridgeState {
    pub log: Arc<dyn LogSink>,
    /// Current request, keyed by script-facing field names.
    pub request: serde_json::Map<String, serde_json::Value>,
}

impl BridgeState {
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self {
            log,
            request: serde_json::Map::new(),
        }
    }
}

/// Forward stringified values to the host log sink, one line each.
#[op2]
pub fn op_rasp_log(state: &mut OpState, #[serde] values: Vec<String>) {
    let Some(bridge) = state.try_borrow::<BridgeState>() else {
        for value in values {
            tracing::info!(target: "rasp::plugin", "{}", value);
        }
        return;
    };
    for value in values {
        bridge.log.log(&value);
    }
}

/// Tokenize a SQL statement and return the token texts.
#[op2]
#[serde]
pub fn op_rasp_sql_tokenize(#[string] sql: String) -> Vec<String> {
    let result = sql::tokenize(&sql);
    // Not surfaced to scripts.
    for error in &result.errors {
        tracing::trace!("[sql] offset {}: {}", error.offset, error.message);
    }
    result.texts()
}

/// Read one field of the current request, `null` when unset.
#[op2]
#[serde]
pub fn op_rasp_request_get(state: &mut OpState, #[string] field: String) -> serde_json::Value {
    state
        .try_borrow::<BridgeState>()
        .and_then(|bridge| bridge.request.get(&field).cloned())
        .unwrap_or(serde_json::Value::Null)
}

deno_core::extension!(
    rasp_bridge,
    ops = [op_rasp_log, op_rasp_sql_tokenize, op_rasp_request_get],
);

/// The bridge extension. Used for both snapshot creation and restore.
pub fn extension() -> deno_core::Extension {
    rasp_bridge::init_ops()
}

/// Identity of a bridge table: op count plus an order-sensitive checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BridgeFingerprint {
    pub count: usize,
    pub checksum: u64,
}

impl BridgeFingerprint {
    fn of<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        // FNV-1a; stable across builds and platforms.
        let mut checksum: u64 = 0xcbf2_9ce4_8422_2325;
        let mut count = 0;
        for name in names {
            for byte in name.bytes().chain(std::iter::once(0)) {
                checksum ^= u64::from(byte);
                checksum = checksum.wrapping_mul(0x0100_0000_01b3);
            }
            count += 1;
        }
        Self { count, checksum }
    }
}

/// Fingerprint of the table and the extension this binary was built with.
pub fn fingerprint() -> BridgeFingerprint {
    let ext = extension();
    let table = NATIVE_BRIDGE.iter().flat_map(|f| [f.name, f.op]);
    let ops = ext.ops.iter().map(|decl| decl.name);
    BridgeFingerprint::of(table.chain(ops))
}

/// Check the table against the extension's op list.
///
/// Every table entry must name an op the extension registers, in the same
/// order.
pub fn validate_table() -> Result<(), String> {
    let ext = extension();
    let ops: Vec<&str> = ext.ops.iter().map(|decl| decl.name).collect();
    let table: Vec<&str> = NATIVE_BRIDGE.iter().map(|f| f.op).collect();
    if ops != table {
        return Err(format!("bridge table {:?} does not match extension ops {:?}", table, ops));
    }
    Ok(())
}

/// Glue that publishes the bridge table to scripts.
///
/// Creates `__rasp_native` (frozen, one function per table entry) and an
/// empty `__rasp_internal` for the bootstrap scripts to fill.
pub fn install_script() -> String {
    let mut entries = String::new();
    for f in NATIVE_BRIDGE {
        // `log` takes a list of strings; everything else passes through.
        let body = if f.name == "log" {
            format!("(...values) => ops.{}(values.map((v) => String(v)))", f.op)
        } else {
            format!("(...args) => ops.{}(...args)", f.op)
        };
        entries.push_str(&format!("    {}: {},\n", f.name, body));
    }
    format!(
        r#"(() => {{
  const ops = Deno.core.ops;
  const native = {{
{entries}  }};
  Object.defineProperty(globalThis, "__rasp_native", {{
    value: Object.freeze(native),
    enumerable: false,
    writable: false,
    configurable: false,
  }});
  Object.defineProperty(globalThis, "__rasp_internal", {{
    value: {{}},
    enumerable: false,
    writable: false,
    configurable: false,
  }});
}})();
"#
    )
}
