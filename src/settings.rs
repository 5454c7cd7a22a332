//! Host-side settings for acvm.
//!
//! Everything that describes the host rather than a single VM lives here:
//! where the virtualization engine and firmware are, which port range the
//! monitor channel draws from, and how long each supervisor timer waits.
//! The struct round-trips through `settings.toml`; every field has a default
//! so a missing or partial file is fine.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Architecture;
use crate::error::LaunchError;

/// Fixed host port forwarded to the guest's SSH daemon.
pub const SSH_HOST_PORT: u16 = 10022;
/// Fixed host port forwarded to the guest's RDP service.
pub const RDP_HOST_PORT: u16 = 13389;

/// Searched after `$PATH` for Homebrew installs.
const FALLBACK_ENGINE_DIRS: &str = "/opt/homebrew/bin:/usr/local/bin";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding `qemu-system-<arch>` executables.
    pub engine_dir: Option<PathBuf>,
    /// Explicit engine executable, used for every architecture when set.
    pub engine_path: Option<PathBuf>,
    /// UEFI firmware image passed as `-bios`.
    pub firmware_path: PathBuf,
    pub monitor_port_min: u16,
    pub monitor_port_max: u16,
    pub timings: Timings,
}

/// Supervisor timer durations, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Timings {
    /// Wait after spawn before touching the monitor socket.
    pub monitor_connect_delay: u64,
    /// Wait between `cont` and `system_powerdown` when stopping a paused VM.
    pub powerdown_delay: u64,
    /// Wait after a stop request before cleanup runs unconditionally.
    pub forced_cleanup_delay: u64,
    /// Wait between closing the monitor socket and dropping the client.
    pub channel_release_delay: u64,
    /// Wait between a `screendump` request and loading the preview.
    pub preview_delay: u64,
    /// Upper bound for the post-spawn liveness check.
    pub liveness_timeout: u64,
    pub monitor_connect_attempts: u32,
    pub monitor_retry_backoff: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine_dir: None,
            engine_path: None,
            firmware_path: default_firmware_path(),
            monitor_port_min: 60000,
            monitor_port_max: 65000,
            timings: Timings::default(),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            monitor_connect_delay: 3000,
            powerdown_delay: 1000,
            forced_cleanup_delay: 1000,
            channel_release_delay: 200,
            preview_delay: 200,
            liveness_timeout: 5000,
            monitor_connect_attempts: 10,
            monitor_retry_backoff: 250,
        }
    }
}

impl Timings {
    pub fn monitor_connect_delay(&self) -> Duration {
        Duration::from_millis(self.monitor_connect_delay)
    }

    pub fn powerdown_delay(&self) -> Duration {
        Duration::from_millis(self.powerdown_delay)
    }

    pub fn forced_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.forced_cleanup_delay)
    }

    pub fn channel_release_delay(&self) -> Duration {
        Duration::from_millis(self.channel_release_delay)
    }

    pub fn preview_delay(&self) -> Duration {
        Duration::from_millis(self.preview_delay)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout)
    }

    pub fn monitor_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.monitor_retry_backoff)
    }
}

impl Settings {
    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Deserialize from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Load settings from `path`, writing the defaults there if the file does
    /// not exist yet. A file that fails to parse falls back to defaults.
    pub fn load_or_init(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml(&content) {
                Ok(settings) => {
                    debug!(path = %path.display(), "loaded settings");
                    settings
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid settings file, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                let settings = Self::default();
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(path, settings.to_toml()) {
                    warn!(path = %path.display(), error = %e, "could not write default settings");
                }
                settings
            }
        }
    }

    /// Monitor control ports to draw from, with the bounds normalised.
    pub fn monitor_ports(&self) -> RangeInclusive<u16> {
        let lo = self.monitor_port_min.min(self.monitor_port_max);
        let hi = self.monitor_port_min.max(self.monitor_port_max);
        lo..=hi
    }

    /// Resolve the engine executable for `arch`.
    ///
    /// Order: explicit `engine_path`, then `engine_dir`, then `$PATH`, then
    /// the Homebrew install locations. Only executable files count.
    pub fn engine_for(&self, arch: &Architecture) -> Result<PathBuf, LaunchError> {
        if let Some(path) = &self.engine_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(LaunchError::EngineNotFound(path.display().to_string()));
        }

        let binary = format!("qemu-system-{}", arch.as_str());

        if let Some(dir) = &self.engine_dir {
            if let Ok(found) = which::which_in(&binary, Some(dir), dir) {
                return Ok(found);
            }
        }

        which::which(&binary)
            .or_else(|_| which::which_in(&binary, Some(FALLBACK_ENGINE_DIRS), "/"))
            .map_err(|_| LaunchError::EngineNotFound(binary))
    }
}

fn default_firmware_path() -> PathBuf {
    for candidate in [
        "/opt/homebrew/share/qemu/edk2-aarch64-code.fd",
        "/usr/local/share/qemu/edk2-aarch64-code.fd",
        "/usr/share/qemu/edk2-aarch64-code.fd",
    ] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return path;
        }
    }
    PathBuf::from("QEMU_EFI.fd")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.monitor_ports(), 60000..=65000);
        assert_eq!(s.timings.monitor_connect_delay(), Duration::from_secs(3));
        assert_eq!(s.timings.powerdown_delay(), Duration::from_secs(1));
        assert_eq!(s.timings.forced_cleanup_delay(), Duration::from_secs(1));
        assert_eq!(s.timings.channel_release_delay(), Duration::from_millis(200));
        assert_eq!(s.timings.preview_delay(), Duration::from_millis(200));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let s = Settings::from_toml(
            r#"
            monitor_port_min = 61000

            [timings]
            forced_cleanup_delay = 50
            "#,
        )
        .expect("parse");
        assert_eq!(s.monitor_port_min, 61000);
        assert_eq!(s.monitor_port_max, 65000);
        assert_eq!(s.timings.forced_cleanup_delay, 50);
        assert_eq!(s.timings.monitor_connect_delay, 3000);
    }

    #[test]
    fn inverted_port_bounds_are_normalised() {
        let s = Settings {
            monitor_port_min: 65000,
            monitor_port_max: 60000,
            ..Settings::default()
        };
        assert_eq!(s.monitor_ports(), 60000..=65000);
    }

    #[test]
    fn load_or_init_writes_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("nested").join("settings.toml");

        let s = Settings::load_or_init(&path);
        assert_eq!(s, Settings::default());
        assert!(path.exists());

        let reloaded = Settings::load_or_init(&path);
        assert_eq!(reloaded, s);
    }

    #[test]
    fn explicit_engine_path_must_exist() {
        let s = Settings {
            engine_path: Some(PathBuf::from("/definitely/not/here/qemu")),
            ..Settings::default()
        };
        let err = s.engine_for(&Architecture::Aarch64).unwrap_err();
        assert!(matches!(err, LaunchError::EngineNotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn engine_dir_requires_an_executable() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let engine = tmp.path().join("qemu-system-x86_64");
        std::fs::write(&engine, "#!/bin/sh\n").unwrap();
        let s = Settings {
            engine_dir: Some(tmp.path().to_path_buf()),
            ..Settings::default()
        };

        std::fs::set_permissions(&engine, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert_ne!(s.engine_for(&Architecture::X86_64).ok(), Some(engine.clone()));

        std::fs::set_permissions(&engine, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(s.engine_for(&Architecture::X86_64).unwrap(), engine);
    }

    #[test]
    fn unknown_engine_is_not_found() {
        let err = Settings::default()
            .engine_for(&Architecture::Other("no-such-arch-for-tests".into()))
            .unwrap_err();
        assert!(matches!(err, LaunchError::EngineNotFound(name) if name == "qemu-system-no-such-arch-for-tests"));
    }
}
