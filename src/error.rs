//! Error types for the acvm library.
//!
//! The binary wraps these in `anyhow`; library callers can match on the kind.

use std::path::PathBuf;

use thiserror::Error;

/// Failures computing a launch specification. No process exists when these
/// are returned.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("main image not found: {}", .0.display())]
    MissingMainImage(PathBuf),

    #[error("unsupported architecture `{0}` (expected aarch64 or x86_64)")]
    UnsupportedArchitecture(String),

    #[error("firmware image not found: {}", .0.display())]
    MissingFirmware(PathBuf),

    #[error("nvram store not found: {}", .0.display())]
    MissingNvram(PathBuf),

    #[error("virtualization engine not found: {0}")]
    EngineNotFound(String),
}

/// Failures on the monitor control channel.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("could not connect to monitor on port {port}: {source}")]
    Connection {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("monitor handshake failed: {0}")]
    Handshake(String),

    #[error("monitor send failed: {0}")]
    Send(String),

    #[error("no monitor channel is attached")]
    Closed,
}

/// Failures reading or writing persisted VM records.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not encode VM record: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not parse VM record {}: {source}", path.display())]
    Deserialize {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid VM record: {0}")]
    Invalid(String),
}

/// Failures surfaced by the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("failed to spawn engine process: {0}")]
    SpawnFailure(#[source] std::io::Error),

    #[error("configuration `{current}` is in use; cannot switch to `{requested}` while it runs")]
    ConfigLocked { current: String, requested: String },

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("supervisor task has shut down")]
    Gone,
}
