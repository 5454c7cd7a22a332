//! VM management module for acvm.
//!
//! Builds engine command lines from persisted VM records, supervises the
//! engine process, and drives it over the monitor protocol.

pub mod launch;
pub mod monitor;
pub mod preview;
pub mod qmp;
pub mod supervisor;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use launch::{LaunchMode, LaunchSpec};
pub use monitor::MonitorClient;
pub use preview::PreviewImage;
pub use qmp::{QmpCommand, QmpEvent};
pub use supervisor::{
    OperationOutcome, StartOutcome, SupervisorEvent, SupervisorHandle, SupervisorStatus,
};
