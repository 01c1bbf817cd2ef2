use serde::{Deserialize, Serialize};

use qa_runner::core::types::{ResultKind, Verdict};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
    Aborted,
    Error,
}

/// Classify a run by its verdict; `None` means the run never produced one.
pub fn classify_outcome(verdict: Option<&Verdict>) -> Outcome {
    let Some(verdict) = verdict else {
        return Outcome::Error;
    };
    match verdict.kind {
        ResultKind::TestPassed => Outcome::Passed,
        ResultKind::TestAssertionFailed | ResultKind::ElementNotFound => Outcome::Failed,
        ResultKind::Aborted => Outcome::Aborted,
        ResultKind::ExecutionError => Outcome::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passed_only_on_test_passed() {
        assert_eq!(
            classify_outcome(Some(&Verdict::passed("done"))),
            Outcome::Passed
        );
    }

    #[test]
    fn assertion_and_missing_element_are_failures() {
        assert_eq!(
            classify_outcome(Some(&Verdict::failed(ResultKind::TestAssertionFailed, "wrong screen"))),
            Outcome::Failed
        );
        assert_eq!(
            classify_outcome(Some(&Verdict::failed(ResultKind::ElementNotFound, "no Settings"))),
            Outcome::Failed
        );
    }

    #[test]
    fn aborted_and_errors() {
        assert_eq!(
            classify_outcome(Some(&Verdict::aborted("cancelled"))),
            Outcome::Aborted
        );
        assert_eq!(
            classify_outcome(Some(&Verdict::execution_error("stuck repeating"))),
            Outcome::Error
        );
        assert_eq!(classify_outcome(None), Outcome::Error);
    }
}
