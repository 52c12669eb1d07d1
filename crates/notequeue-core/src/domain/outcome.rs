//! Outcome model: what the executor reports for one attempt.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Failure,
}

/// Result of a single executor call.
///
/// - `SUCCESS`: the note was produced; the record becomes SUCCESS.
/// - `FAILURE`: retried while attempts remain, then FAILED with `reason`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            kind: OutcomeKind::Success,
            reason: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            reason: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }

    /// Reason recorded as `last_error` when this outcome is a failure.
    pub fn error_message(&self) -> String {
        self.reason
            .clone()
            .unwrap_or_else(|| "executor reported failure".to_string())
    }
}

impl<E: std::fmt::Display> From<Result<(), E>> for Outcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Outcome::success(),
            Err(e) => Outcome::failure(e.to_string()),
        }
    }
}
