//! Application directory structure for acvm.
//!
//! Provides a single `AcvmPaths` struct that resolves all standard directories
//! and ensures they exist on first launch. Follows macOS conventions:
//!
//! - Config:    `~/.config/acvm/`  (host settings, human-editable)
//! - VMs:       `~/Library/Application Support/com.oltica.ACVM/`  (one record per VM)
//! - Logs:      `~/Library/Logs/acvm/`
//!
//! On non-macOS, falls back to XDG paths.

use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg(target_os = "macos")]
const BUNDLE_ID: &str = "com.oltica.ACVM";
const APP_NAME: &str = "acvm";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct AcvmPaths {
    /// Host settings: `~/.config/acvm/`
    pub config: PathBuf,
    /// Persisted VM records, keyed by VM name
    pub vms: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl AcvmPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        Some(Self {
            config: resolve_config_dir(&home),
            vms: resolve_vm_dir(&home),
            logs: resolve_log_dir(&home),
        })
    }

    /// Root all paths under one directory. Used by tests and `--root`.
    pub fn under(root: &Path) -> Self {
        Self {
            config: root.join("config"),
            vms: root.join("vms"),
            logs: root.join("logs"),
        }
    }

    /// Path of the host settings file.
    pub fn settings_file(&self) -> PathBuf {
        self.config.join("settings.toml")
    }

    /// Default firmware variable store for a new VM, next to its record.
    pub fn nvram_for(&self, vm_name: &str) -> PathBuf {
        self.vms.join(format!("{vm_name}.nvram"))
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.vms, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!(dir = %dir.display(), "ensured directory");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_vm_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_vm_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_produces_valid_paths() {
        let paths = AcvmPaths::resolve().expect("HOME should be set in tests");
        assert!(paths.config.to_string_lossy().contains("acvm"));
        assert!(paths.logs.to_string_lossy().contains("acvm"));
        assert!(paths.settings_file().ends_with("settings.toml"));
    }

    #[test]
    fn ensure_creates_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = AcvmPaths::under(tmp.path());

        paths.ensure().expect("ensure should succeed");

        assert!(paths.config.is_dir());
        assert!(paths.vms.is_dir());
        assert!(paths.logs.is_dir());
        assert_eq!(paths.nvram_for("ubuntu"), paths.vms.join("ubuntu.nvram"));
    }
}
