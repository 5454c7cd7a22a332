//! File watcher for VM record hot-reload.
//!
//! Watches `<vms>/<name>.toml` and hands the re-parsed record to a callback,
//! which the CLI forwards to the supervisor as a configuration replacement.
//!
//! # Usage
//!
//! ```rust,ignore
//! let watcher = ConfigWatcher::start(store.clone(), "ubuntu", move |config| {
//!     let _ = tx.send(config);
//! })?;
//! ```

use std::ffi::OsString;
use std::path::Path;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::config::{ConfigStore, VmConfig};

/// Spawn a watcher on the *parent directory* of `path`.
///
/// Editors write to a temp file then rename, so watching the file itself
/// misses changes. Watching the directory and filtering by file name does not.
///
/// `on_change` runs on the notify thread whenever the target is created or
/// modified.
pub fn spawn_watcher<F>(path: &Path, on_change: F) -> notify::Result<RecommendedWatcher>
where
    F: Fn() + Send + 'static,
{
    let (Some(target), Some(parent)) = (path.file_name(), path.parent()) else {
        return Err(notify::Error::path_not_found().add_path(path.to_path_buf()));
    };
    let target: OsString = target.to_os_string();

    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                let affects_target = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().is_some_and(|f| f == target));
                if affects_target {
                    on_change();
                }
            }
            Err(e) => warn!(error = %e, "config watch error"),
        }
    })?;

    watcher.watch(parent, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Owns a watcher for one VM record.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching the record for `name`. Records that fail to parse are
    /// logged and skipped; the callback only sees valid configurations.
    pub fn start<F>(store: ConfigStore, name: &str, on_reload: F) -> notify::Result<Self>
    where
        F: Fn(VmConfig) + Send + 'static,
    {
        let path = store.path_for(name);
        let watched = path.clone();
        let watcher = spawn_watcher(&path, move || match ConfigStore::load_file(&watched) {
            Ok(config) => {
                debug!(path = %watched.display(), "VM record changed on disk");
                on_reload(config);
            }
            // Partial writes show up here; the next event carries the full file.
            Err(e) => debug!(path = %watched.display(), error = %e, "skipping unreadable VM record"),
        })?;

        Ok(Self { _watcher: watcher })
    }
}
