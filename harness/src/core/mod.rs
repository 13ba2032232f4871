//! Deterministic, pure logic shared by the harness.
//!
//! Core modules must be free of I/O side effects. Randomness enters only
//! through caller-supplied `Rng`s so selection stays reproducible in tests.

pub mod budget;
pub mod classifier;
pub mod module;
pub mod region;
pub mod retry_policy;
pub mod state;
