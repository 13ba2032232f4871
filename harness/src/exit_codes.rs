//! Stable exit codes for `modtest` commands.

/// Every selected case passed.
pub const OK: i32 = 0;
/// At least one case failed or errored.
pub const FAILED: i32 = 1;
/// Invalid invocation, settings, or case files; nothing was provisioned.
pub const INVALID: i32 = 2;
