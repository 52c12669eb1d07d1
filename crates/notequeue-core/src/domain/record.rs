//! Task record: one row of the durable job ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, WorkerId};
use super::state::TaskStatus;

/// `last_error` written when the attempt budget is used up.
pub const MAX_ATTEMPTS_EXCEEDED: &str = "max attempts exceeded";

/// `last_error` written when a claimed payload cannot be parsed.
pub const PAYLOAD_PARSE_FAILURE: &str = "payload parse failure";

/// `last_error` written by cancellation.
pub const CANCELED: &str = "canceled";

/// Exclusive, worker-tagged claim on a record.
///
/// Modelled as one optional value on the record so `locked_at` and
/// `lock_owner` can only be set or cleared together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: WorkerId,
    pub locked_at: DateTime<Utc>,
}

/// Metadata + payload for a task.
///
/// Design:
/// - This is the single source of truth for task state.
/// - The hint channel only ever carries the `task_id`.
/// - `created_at` fixes FIFO order and survives re-submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,

    /// Payload exactly as submitted (JSON text).
    pub payload_json: String,

    pub status: TaskStatus,

    /// Number of claim events since the last (re-)submission.
    pub attempts: u32,

    pub max_attempts: u32,

    /// Set if and only if status is RUNNING.
    pub lease: Option<Lease>,

    /// Per-task pause; hides a QUEUED record from dequeue.
    pub paused: bool,

    pub last_error: Option<String>,

    /// Earliest time the record may be claimed (retry backoff).
    pub available_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Submission data for an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub task_id: TaskId,
    pub payload_json: String,
    pub max_attempts: u32,
}

/// Precondition of a guarded single-row transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// Record must currently have this status.
    Status(TaskStatus),

    /// Record must be RUNNING under this worker's lease.
    HeldBy(WorkerId),

    /// RUNNING with no lease at all (a half-written claim).
    Unleased,

    /// QUEUED with the attempt budget used up, checked at update time.
    Exhausted,
}

impl Expect {
    pub fn matches(&self, record: &TaskRecord) -> bool {
        match self {
            Expect::Status(status) => record.status == *status,
            Expect::HeldBy(owner) => {
                record.status == TaskStatus::Running
                    && record.lease.as_ref().is_some_and(|l| &l.owner == owner)
            }
            Expect::Unleased => record.status == TaskStatus::Running && record.lease.is_none(),
            Expect::Exhausted => {
                record.status == TaskStatus::Queued && !record.has_attempts_left()
            }
        }
    }
}

/// Where a record goes when it leaves RUNNING (or is retired from QUEUED).
/// Every settle clears the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settle {
    Succeed,

    /// Back to QUEUED, claimable again from `available_at`.
    Requeue {
        error: Option<String>,
        available_at: DateTime<Utc>,
    },

    Fail { error: String },
}

impl Settle {
    pub fn status(&self) -> TaskStatus {
        match self {
            Settle::Succeed => TaskStatus::Success,
            Settle::Requeue { .. } => TaskStatus::Queued,
            Settle::Fail { .. } => TaskStatus::Failed,
        }
    }
}

impl TaskRecord {
    pub fn new(task: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task.task_id,
            payload_json: task.payload_json,
            status: TaskStatus::Queued,
            attempts: 0,
            max_attempts: task.max_attempts,
            lease: None,
            paused: false,
            last_error: None,
            available_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Re-submission: reset everything except identity and `created_at`.
    pub fn rearm(&mut self, task: NewTask, now: DateTime<Utc>) {
        self.payload_json = task.payload_json;
        self.status = TaskStatus::Queued;
        self.attempts = 0;
        self.max_attempts = task.max_attempts;
        self.lease = None;
        self.paused = false;
        self.last_error = None;
        self.available_at = now;
        self.updated_at = now;
    }

    /// QUEUED and unpaused; counted by `size()`.
    pub fn is_waiting(&self) -> bool {
        self.status == TaskStatus::Queued && !self.paused
    }

    /// Visible to dequeue at `now` (global pause is checked by the caller).
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_waiting() && self.attempts < self.max_attempts && self.available_at <= now
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Mark as running (increment attempts).
    pub fn claim(&mut self, owner: WorkerId, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.attempts += 1;
        self.lease = Some(Lease {
            owner,
            locked_at: now,
        });
        self.updated_at = now;
    }

    pub fn settle(&mut self, settle: &Settle, now: DateTime<Utc>) {
        self.status = settle.status();
        self.lease = None;
        match settle {
            Settle::Succeed => self.last_error = None,
            Settle::Requeue {
                error,
                available_at,
            } => {
                if error.is_some() {
                    self.last_error = error.clone();
                }
                self.available_at = *available_at;
            }
            Settle::Fail { error } => self.last_error = Some(error.clone()),
        }
        self.updated_at = now;
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Canceled;
        self.last_error = Some(CANCELED.to_string());
        self.lease = None;
        self.updated_at = now;
    }
}
