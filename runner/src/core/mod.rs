//! Deterministic, pure logic shared by the runner.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! snapshots and histories and return deterministic outputs suitable for tests.

pub mod action;
pub mod budget;
pub mod classifier;
pub mod metrics;
pub mod resolver;
pub mod run_state;
pub mod sequencer;
pub mod termination;
pub mod test_spec;
pub mod types;
