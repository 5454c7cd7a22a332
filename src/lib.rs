//! acvm: supervise QEMU-backed virtual machines.
//!
//! A VM record ([`config::VmConfig`]) is turned into an engine command line
//! ([`vm::launch`]), the engine process is owned by a supervisor actor
//! ([`vm::supervisor`]) and driven over the monitor protocol ([`vm::monitor`]).
//! Lifecycle rules live in [`state_machine::lifecycle_sm`].

pub mod config;
pub mod config_watcher;
pub mod error;
pub mod logging;
pub mod paths;
pub mod settings;
pub mod state_machine;
pub mod vm;
