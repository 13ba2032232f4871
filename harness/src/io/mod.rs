//! I/O helpers for the harness: processes, provisioning tool, settings, environment.

pub mod config;
pub mod environment;
pub mod process;
pub mod provisioner;
