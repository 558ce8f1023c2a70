//! Host configuration.
//!
//! Layered with figment: built-in defaults, then `rasp.toml` (or the file
//! given with `--config`), then `RASP_*` environment variables with `__`
//! separating nested keys (`RASP_ENGINE__TIMEOUT_MS=250`).

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use rasp_js_runtime::EngineConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "rasp.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    /// Emit tracing output as JSON.
    #[serde(default)]
    pub log_json: bool,

    /// File alarms are appended to; stdout when unset.
    #[serde(default)]
    pub alarm_log: Option<PathBuf>,
}

impl HostConfig {
    /// Load from `path` (or `rasp.toml` in the working directory) and the
    /// environment. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Self::figment(file).extract()
    }

    pub fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(HostConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("RASP_").split("__"))
    }
}
