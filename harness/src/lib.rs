//! Lifecycle orchestration for provisioning-backed module tests.
//!
//! Each test case provisions one infrastructure module in a randomly selected
//! region, runs assertions against the applied outputs, and always tears the
//! module down again. The crate is split the same way throughout:
//!
//! - **[`core`]**: Pure logic (region selection, retry policy, error
//!   classification, typed module configuration, lifecycle state machine).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (child processes, the terraform
//!   provisioner, environment capture, settings files).
//!
//! Orchestration modules ([`executor`], [`lifecycle`], [`driver`]) combine the
//! two into the per-case lifecycle and the parallel case runner.

pub mod cancel;
pub mod core;
pub mod driver;
pub mod error;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod lifecycle;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
