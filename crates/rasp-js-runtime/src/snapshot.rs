//! Snapshot construction.
//!
//! Boots a scratch runtime with the native bridge, the bundled scripts and
//! every plugin, then serializes its heap. Workers restore from that image
//! instead of re-running any of it.

use std::sync::Arc;

use deno_core::JsRuntimeForSnapshot;
use deno_core::RuntimeOptions;

use crate::error::SnapshotError;
use crate::ops::{self, BridgeFingerprint, BridgeState};
use crate::registry::PluginSource;
use crate::services::LogSink;
use crate::ISOLATE_CREATE_LOCK;

/// Bundled scripts, in dependency order.
pub const BOOTSTRAP_SCRIPTS: &[(&str, &str)] = &[
    ("console.js", include_str!("../js/console.js")),
    ("checkpoint.js", include_str!("../js/checkpoint.js")),
    ("error.js", include_str!("../js/error.js")),
    ("context.js", include_str!("../js/context.js")),
    ("sql_tokenize.js", include_str!("../js/sql_tokenize.js")),
    ("rasp.js", include_str!("../js/rasp.js")),
];

/// A serialized, fully bootstrapped runtime.
#[derive(Debug, Clone)]
pub struct SnapshotBlob {
    /// The image. Leaked once per build: restores need a `'static` slice.
    pub bytes: &'static [u8],
    /// Bridge the image was built against.
    pub bridge: BridgeFingerprint,
    /// Plugins that ran to completion during the build.
    pub plugins: Vec<String>,
}

/// Builds a [`SnapshotBlob`].
pub struct SnapshotBuilder {
    log: Arc<dyn LogSink>,
}

impl SnapshotBuilder {
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self { log }
    }

    /// Build an image from the bundled scripts and `plugins`.
    ///
    /// A failing bundled script aborts the build. A failing plugin is logged
    /// and skipped.
    pub fn build(&self, plugins: &[PluginSource]) -> Result<SnapshotBlob, SnapshotError> {
        self.build_with(BOOTSTRAP_SCRIPTS, plugins)
    }

    pub(crate) fn build_with(
        &self,
        scripts: &[(&'static str, &'static str)],
        plugins: &[PluginSource],
    ) -> Result<SnapshotBlob, SnapshotError> {
        ops::validate_table().map_err(SnapshotError::Install)?;

        let _lock = ISOLATE_CREATE_LOCK.lock();
        tracing::debug!("[snapshot] Creating snapshot runtime");
        let mut runtime = JsRuntimeForSnapshot::new(RuntimeOptions {
            extensions: vec![ops::extension()],
            ..Default::default()
        });
        runtime
            .op_state()
            .borrow_mut()
            .put(BridgeState::new(Arc::clone(&self.log)));

        runtime
            .execute_script("<rasp:bridge>", ops::install_script())
            .map_err(|e| SnapshotError::Install(e.to_string()))?;

        for &(script, source) in scripts {
            if let Err(e) = runtime.execute_script(script, source) {
                let message = e.to_string();
                tracing::error!("Fail to initialize js plugin - {}", message);
                return Err(SnapshotError::Bootstrap { script, message });
            }
        }

        let mut loaded = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            let name: &'static str = Box::leak(plugin.filename.clone().into_boxed_str());
            let wrapped = format!("(function(){{\n{}\n}})()", plugin.code);
            match runtime.execute_script(name, wrapped) {
                Ok(_) => {
                    tracing::debug!("[snapshot] Loaded plugin {}", plugin.filename);
                    loaded.push(plugin.filename.clone());
                }
                Err(e) => {
                    tracing::warn!("[snapshot] Plugin {} failed to load", plugin.filename);
                    self.log.log(&e.to_string());
                }
            }
        }

        let bytes = runtime.snapshot();
        if bytes.is_empty() {
            return Err(SnapshotError::Empty);
        }
        tracing::debug!(
            "[snapshot] Built {} bytes with {}/{} plugins",
            bytes.len(),
            loaded.len(),
            plugins.len()
        );

        Ok(SnapshotBlob {
            bytes: Box::leak(bytes),
            bridge: ops::fingerprint(),
            plugins: loaded,
        })
    }
}
