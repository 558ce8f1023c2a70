// Plugin Registry - Discovers plugin sources in the plugins directory
//
// A bad file never fails the load: it is skipped with a warning and the
// remaining files are still read.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::config::MAX_PLUGIN_SIZE;

/// One plugin file, read at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSource {
    /// File name (no directory), also used as the script name.
    pub filename: String,
    /// Full source text.
    pub code: String,
}

/// Load every plugin in `dir`, ordered by filename.
///
/// A missing directory yields an empty list.
pub fn load(dir: &Path) -> Vec<PluginSource> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("[registry] Plugin directory {} not readable: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut sources = Vec::new();
    for entry in entries.flatten() {
        let Some(filename) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if !has_js_extension(&filename) {
            continue;
        }

        let path = entry.path();
        // Follows symlinks; a dangling link is skipped like any non-file.
        let metadata = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            Ok(_) | Err(_) => {
                warn!("[registry] Skipping {}: not a regular file", path.display());
                continue;
            }
        };

        if metadata.len() > MAX_PLUGIN_SIZE {
            warn!(
                "Ignored Javascript plugin file '{}', as it exceeds 10 MB in file size.",
                filename
            );
            continue;
        }

        match fs::read_to_string(&path) {
            Ok(code) => {
                debug!("[registry] Loaded plugin {} ({} bytes)", filename, code.len());
                sources.push(PluginSource { filename, code });
            }
            Err(e) => {
                warn!("Ignored Javascript plugin file '{}': {}", filename, e);
            }
        }
    }

    sources.sort_by(|a, b| a.filename.cmp(&b.filename));
    sources
}

fn has_js_extension(name: &str) -> bool {
    name.len() >= 3
        && name
            .get(name.len() - 3..)
            .is_some_and(|ext| ext.eq_ignore_ascii_case(".js"))
}
