//! VM configuration records and their on-disk store.
//!
//! A `VmConfig` describes one VM and is immutable for the length of a
//! session. Records are written by an external editor (or `acvm create`) as
//! `<name>.toml` in the VM directory; the supervisor only rewrites them to
//! clear the single-session CD mount flags after a stop.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StoreError;

// ---------------------------------------------------------------------------
// Architecture
// ---------------------------------------------------------------------------

/// Guest architecture. Unknown names survive a load so the launch step can
/// report them instead of the record silently disappearing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Architecture {
    Aarch64,
    X86_64,
    Other(String),
}

impl Architecture {
    pub fn as_str(&self) -> &str {
        match self {
            Architecture::Aarch64 => "aarch64",
            Architecture::X86_64 => "x86_64",
            Architecture::Other(name) => name,
        }
    }
}

impl From<String> for Architecture {
    fn from(value: String) -> Self {
        match value.as_str() {
            "aarch64" => Architecture::Aarch64,
            "x86_64" => Architecture::X86_64,
            _ => Architecture::Other(value),
        }
    }
}

impl From<Architecture> for String {
    fn from(value: Architecture) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// VmConfig
// ---------------------------------------------------------------------------

/// Configuration record for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Unique name; used as the process name and the record file stem.
    pub name: String,
    pub architecture: Architecture,
    pub cores: u32,
    pub ram_megabytes: u32,

    pub main_image: PathBuf,
    #[serde(default = "default_true")]
    pub use_virtio: bool,
    /// `writethrough` when set, `directsync` otherwise.
    #[serde(default)]
    pub use_write_through_cache: bool,

    #[serde(default)]
    pub cd_image: PathBuf,
    #[serde(default)]
    pub mount_cd_image: bool,
    #[serde(default)]
    pub cd_image2: PathBuf,
    #[serde(default)]
    pub mount_cd_image2: bool,

    /// Appended verbatim to the `-nic` options.
    #[serde(default)]
    pub nic_extra_options: String,
    #[serde(default)]
    pub ssh_port_forward: bool,
    #[serde(default)]
    pub rdp_port_forward: bool,

    /// Emulated display device, passed as a `-device` value.
    #[serde(default = "default_graphics_device")]
    pub graphics_device: String,

    /// Read-write firmware variable store. Stored by reference.
    pub nvram: PathBuf,

    #[serde(default)]
    pub unhide_mouse_pointer: bool,
}

fn default_true() -> bool {
    true
}

fn default_graphics_device() -> String {
    "virtio-gpu-pci".to_string()
}

impl VmConfig {
    /// A record with the documented defaults for everything optional.
    pub fn new(
        name: impl Into<String>,
        architecture: Architecture,
        main_image: impl Into<PathBuf>,
        nvram: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            architecture,
            cores: 4,
            ram_megabytes: 4096,
            main_image: main_image.into(),
            use_virtio: true,
            use_write_through_cache: false,
            cd_image: PathBuf::new(),
            mount_cd_image: false,
            cd_image2: PathBuf::new(),
            mount_cd_image2: false,
            nic_extra_options: String::new(),
            ssh_port_forward: false,
            rdp_port_forward: false,
            graphics_device: default_graphics_device(),
            nvram: nvram.into(),
            unhide_mouse_pointer: false,
        }
    }

    /// Check the invariants a record must satisfy before it is stored.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.name.trim().is_empty() {
            return Err(StoreError::Invalid("name must not be empty".into()));
        }
        if self.name.contains('/') || self.name.contains('\\') {
            return Err(StoreError::Invalid(format!(
                "name `{}` must not contain path separators",
                self.name
            )));
        }
        if self.cores == 0 {
            return Err(StoreError::Invalid("cores must be positive".into()));
        }
        if self.ram_megabytes == 0 {
            return Err(StoreError::Invalid("ram must be positive".into()));
        }
        Ok(())
    }

    /// Clear the CD mount flags. Mounts last for one session only.
    pub fn reset_cd_mounts(&mut self) {
        self.mount_cd_image = false;
        self.mount_cd_image2 = false;
    }

    pub fn to_toml(&self) -> Result<String, StoreError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

/// Directory of persisted VM records, one `<name>.toml` per VM.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.toml"))
    }

    pub fn save(&self, config: &VmConfig) -> Result<(), StoreError> {
        config.validate()?;
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(&config.name);
        std::fs::write(&path, config.to_toml()?)
            .map_err(|source| StoreError::Io { path: path.clone(), source })?;
        info!(vm = %config.name, path = %path.display(), "saved VM record");
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<VmConfig, StoreError> {
        Self::load_file(&self.path_for(name))
    }

    pub fn load_file(path: &Path) -> Result<VmConfig, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| StoreError::Deserialize {
            path: path.to_path_buf(),
            source,
        })
    }

    /// All readable records, sorted by name. Broken files are skipped.
    pub fn list(&self) -> Result<Vec<VmConfig>, StoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut configs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            match Self::load_file(&path) {
                Ok(config) => configs.push(config),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable VM record"),
            }
        }
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    /// Remove the record and its nvram store. Disk images are left alone.
    pub fn delete(&self, config: &VmConfig) -> Result<(), StoreError> {
        let path = self.path_for(&config.name);
        std::fs::remove_file(&path).map_err(|source| StoreError::Io { path, source })?;

        match std::fs::remove_file(&config.nvram) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(vm = %config.name, nvram = %config.nvram.display(), "nvram store already gone");
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: config.nvram.clone(),
                    source,
                });
            }
        }
        info!(vm = %config.name, "deleted VM record");
        Ok(())
    }
}
