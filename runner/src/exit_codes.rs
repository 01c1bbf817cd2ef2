//! Stable exit codes for qa-runner CLI commands.

use crate::core::types::{ResultKind, Verdict};

/// Command succeeded, or the run ended with a PASS verdict.
pub const OK: i32 = 0;
/// Invalid case/config/record, or any other error before a verdict.
pub const INVALID: i32 = 1;
/// The run ended with a FAIL verdict.
pub const FAIL: i32 = 2;
/// The run was cancelled or hit its wall-clock deadline.
pub const ABORTED: i32 = 3;

/// Exit code for a finished run.
pub fn for_verdict(verdict: &Verdict) -> i32 {
    match verdict.kind {
        ResultKind::TestPassed => OK,
        ResultKind::Aborted => ABORTED,
        ResultKind::TestAssertionFailed
        | ResultKind::ElementNotFound
        | ResultKind::ExecutionError => FAIL,
    }
}
