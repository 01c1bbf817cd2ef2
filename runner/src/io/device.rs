//! Device abstraction consumed by the run loop.
//!
//! [`SnapshotProvider`] observes the screen and [`DeviceExecutor`] performs
//! actions. The ADB bridge implements both; tests use a scripted device.

use std::time::Duration;

use thiserror::Error;

use crate::core::action::ActionProposal;
use crate::core::types::{ExecutionOutcome, ScreenSnapshot, UiElement};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device i/o failed: {0}")]
    Io(String),
    #[error("device call exceeded {0:?}")]
    Timeout(Duration),
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

impl DeviceError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Io(_) | DeviceError::Timeout(_))
    }
}

/// One accepted action ready for dispatch.
#[derive(Debug, Clone)]
pub struct DeviceRequest<'a> {
    pub action: &'a ActionProposal,
    /// Element the resolver picked for targeted actions.
    pub element: Option<&'a UiElement>,
    /// Bounded wait for the whole call.
    pub timeout: Duration,
}

pub trait SnapshotProvider {
    fn capture(&mut self, timeout: Duration) -> Result<ScreenSnapshot, DeviceError>;
}

pub trait DeviceExecutor {
    /// Perform the action. `Ok` with `success == false` means the device
    /// answered but the action did not take effect; `Err` means the call
    /// itself failed.
    fn execute(&mut self, request: &DeviceRequest<'_>) -> Result<ExecutionOutcome, DeviceError>;
}
