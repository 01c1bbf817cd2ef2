//! Mobile UI test-automation core.
//!
//! A run drives one test case against a device: observe the screen, ask a
//! proposer for the next action, enforce mandatory action ordering, resolve
//! the target element, dispatch, record, and repeat until exactly one verdict
//! is produced. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (resolution, sequencing,
//!   termination, scoring). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (adb, the proposer command, case and
//!   config files, run artifacts). Isolated behind traits to enable scripted
//!   collaborators in tests.
//!
//! Orchestration modules ([`step`], [`looping`], [`start`]) coordinate core
//! logic with I/O; [`looping::run_test`] drives one run and
//! [`start::start_run`] also persists its artifacts.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
