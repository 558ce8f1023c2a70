//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Plugin files larger than this are never loaded.
pub const MAX_PLUGIN_SIZE: u64 = 10 * 1024 * 1024;

/// Configuration consumed by [`Engine`](crate::Engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory; plugins are read from `<root_dir>/plugins`.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Hard deadline for a single check call, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Size of the blocking pool the watchdog tasks run on.
    #[serde(default = "default_watchdog_threads")]
    pub watchdog_threads: usize,

    /// Discard a worker's isolate after a timeout instead of reusing it.
    #[serde(default)]
    pub rebuild_isolate_on_timeout: bool,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_timeout_ms() -> u64 {
    100
}

fn default_watchdog_threads() -> usize {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            timeout_ms: default_timeout_ms(),
            watchdog_threads: default_watchdog_threads(),
            rebuild_isolate_on_timeout: false,
        }
    }
}

impl EngineConfig {
    /// Create a config rooted at `root_dir` with default limits.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }

    /// Set the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Discard isolates after a timeout.
    pub fn with_rebuild_on_timeout(mut self, rebuild: bool) -> Self {
        self.rebuild_isolate_on_timeout = rebuild;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn plugin_dir(&self) -> PathBuf {
        plugin_dir(&self.root_dir)
    }
}

/// The plugin directory under a root.
pub fn plugin_dir(root: &Path) -> PathBuf {
    root.join("plugins")
}
