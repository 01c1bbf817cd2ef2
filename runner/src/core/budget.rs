//! Wall-clock budget and cooperative cancellation for a run.
//!
//! Cancellation is observed only at step boundaries; an in-flight device call
//! is never interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Return the time left until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
}

/// Cloneable cancellation handle shared between a run and its controller.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that also reports cancelled once `limit` has elapsed from now.
    pub fn with_deadline(limit: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + limit),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        self.deadline
            .is_some_and(|deadline| remaining_budget(deadline).is_none())
    }

    /// Why the run should stop, if it should.
    pub fn reason(&self) -> Option<&'static str> {
        if self.flag.load(Ordering::SeqCst) {
            Some("cancelled")
        } else if self.is_cancelled() {
            Some("wall-clock deadline exceeded")
        } else {
            None
        }
    }

    /// Clamp `timeout` so it does not outlive the deadline.
    pub fn bound(&self, timeout: Duration) -> Duration {
        match self.deadline.and_then(remaining_budget) {
            Some(remaining) => timeout.min(remaining),
            None => timeout,
        }
    }
}
