//! The engine: loaded plugins, the snapshot built from them, and the shared
//! services every worker uses.
//!
//! Cheap to clone. Checks hold the state read lock for their whole duration,
//! so [`Engine::reload`] waits for in-flight checks before swapping the
//! snapshot.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::registry::{self, PluginSource};
use crate::services::{AlarmSink, LogSink, Sinks};
use crate::snapshot::{SnapshotBlob, SnapshotBuilder, BOOTSTRAP_SCRIPTS};
use crate::watchdog::Watchdog;

#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub config: EngineConfig,
    pub sinks: Sinks,
    pub watchdog: Watchdog,
    pub bootstrap: &'static [(&'static str, &'static str)],
    pub state: RwLock<EngineState>,
}

pub(crate) struct EngineState {
    pub plugins: Vec<PluginSource>,
    pub blob: Option<Arc<SnapshotBlob>>,
    pub generation: u64,
}

/// Point-in-time view of an engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub enabled: bool,
    pub generation: u64,
    pub root_dir: String,
    pub timeout_ms: u64,
    /// Plugin files found on disk.
    pub discovered: Vec<String>,
    /// Plugins whose top-level code ran without throwing.
    pub loaded: Vec<String>,
}

impl Engine {
    /// Build an engine reporting through the tracing sinks.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_sinks(config, Sinks::default())
    }

    /// Build an engine with host sinks.
    pub fn with_sinks(config: EngineConfig, sinks: Sinks) -> Result<Self, EngineError> {
        Self::with_bootstrap(config, sinks, BOOTSTRAP_SCRIPTS)
    }

    /// Build an engine whose snapshots boot from `bootstrap` instead of the
    /// bundled scripts.
    pub(crate) fn with_bootstrap(
        config: EngineConfig,
        sinks: Sinks,
        bootstrap: &'static [(&'static str, &'static str)],
    ) -> Result<Self, EngineError> {
        crate::init_platform();
        let watchdog = Watchdog::new(config.watchdog_threads)?;
        let state = load_state(&config, &sinks.log, bootstrap, 0);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                sinks,
                watchdog,
                bootstrap,
                state: RwLock::new(state),
            }),
        })
    }

    /// Shorthand for [`with_sinks`](Self::with_sinks) with separate sinks.
    pub fn with_alarm_and_log(
        config: EngineConfig,
        alarm: Arc<dyn AlarmSink>,
        log: Arc<dyn LogSink>,
    ) -> Result<Self, EngineError> {
        Self::with_sinks(config, Sinks { alarm, log })
    }

    /// Re-read the plugin directory and rebuild the snapshot.
    ///
    /// Blocks until every in-flight check has finished. Workers pick up the
    /// new snapshot on their next check.
    pub fn reload(&self) -> bool {
        let mut state = self.shared.state.write();
        let generation = state.generation + 1;
        *state = load_state(
            &self.shared.config,
            &self.shared.sinks.log,
            self.shared.bootstrap,
            generation,
        );
        tracing::info!(
            "[engine] Reloaded generation {} ({} plugins, enabled: {})",
            generation,
            state.plugins.len(),
            state.blob.is_some()
        );
        state.blob.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.state.read().blob.is_some()
    }

    /// Discovered plugin files, in load order.
    pub fn plugins(&self) -> Vec<String> {
        let state = self.shared.state.read();
        state.plugins.iter().map(|p| p.filename.clone()).collect()
    }

    pub fn generation(&self) -> u64 {
        self.shared.state.read().generation
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.shared.state.read();
        EngineStatus {
            enabled: state.blob.is_some(),
            generation: state.generation,
            root_dir: self.shared.config.root_dir.display().to_string(),
            timeout_ms: self.shared.config.timeout_ms,
            discovered: state.plugins.iter().map(|p| p.filename.clone()).collect(),
            loaded: state
                .blob
                .as_ref()
                .map(|b| b.plugins.clone())
                .unwrap_or_default(),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Shared {
    pub fn read(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read()
    }
}

fn load_state(
    config: &EngineConfig,
    log: &Arc<dyn LogSink>,
    bootstrap: &[(&'static str, &'static str)],
    generation: u64,
) -> EngineState {
    let dir = config.plugin_dir();
    let plugins = registry::load(&dir);

    let blob = if plugins.is_empty() {
        tracing::info!("[engine] No plugins in {}; checks are disabled", dir.display());
        None
    } else {
        match SnapshotBuilder::new(Arc::clone(log)).build_with(bootstrap, &plugins) {
            Ok(blob) => Some(Arc::new(blob)),
            Err(e) => {
                tracing::error!("[engine] Snapshot build failed, checks are disabled: {}", e);
                None
            }
        }
    };

    EngineState {
        plugins,
        blob,
        generation,
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}
