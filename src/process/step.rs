//! Execution Steps
//!
//! Timestamped status records describing how far an execution got.
//!
//! ```text
//! PREPARE ──> RUNNING ──> SUCCESS
//!    │           └──────> FAILURE
//!    └──> SUCCESS | FAILURE   (fast completion)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an execution at a given step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Inputs are being gathered
    Prepare,
    /// The process is running
    Running,
    /// The execution ended successfully
    Success,
    /// The execution ended with an error
    Failure,
}

impl StepStatus {
    /// Returns true for statuses that end an execution.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Returns true if an execution in this status may move to `next`.
    ///
    /// Repeating a non-terminal status is allowed (progress updates).
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        match self {
            Self::Prepare => true,
            Self::Running => next != Self::Prepare,
            Self::Success | Self::Failure => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepare => "PREPARE",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timestamped status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PStep {
    pub status: StepStatus,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl PStep {
    /// Creates a step stamped with the current time.
    pub fn new(status: StepStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            time: Utc::now(),
        }
    }

    pub fn prepare(message: impl Into<String>) -> Self {
        Self::new(StepStatus::Prepare, message)
    }

    pub fn running(message: impl Into<String>) -> Self {
        Self::new(StepStatus::Running, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(StepStatus::Success, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(StepStatus::Failure, message)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
