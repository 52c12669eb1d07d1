//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::QueueError;

/// Status of a task record.
///
/// State transitions:
/// - Queued -> Running -> Success
/// - Queued -> Running -> Queued (failed attempt, attempts left)
/// - Queued -> Running -> Failed (attempts exhausted / payload corrupt)
/// - Queued -> Failed (exhausted record found by dequeue)
/// - any -> Canceled (control plane)
/// - terminal -> Queued (re-submission with the same task_id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for a worker.
    Queued,

    /// Claimed; a lease is held.
    Running,

    Success,

    Failed,

    Canceled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        }
    }

    /// No further automatic dequeue happens from a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(TaskStatus::Queued),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELED" => Ok(TaskStatus::Canceled),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }
}
