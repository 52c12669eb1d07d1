//! Status - 台帳の集計ビュー

use serde::{Deserialize, Serialize};

use crate::domain::{TaskRecord, TaskStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
    pub canceled: usize,

    /// QUEUED records held back by a per-task pause (subset of `queued`).
    pub paused: usize,

    /// Global pause flag at the time of the snapshot.
    pub queue_paused: bool,
}

impl QueueCounts {
    pub fn record(&mut self, status: TaskStatus, paused: bool) {
        self.add(status, paused, 1);
    }

    /// Add `n` records of one (status, paused) group, as returned by a `GROUP BY`.
    pub fn add(&mut self, status: TaskStatus, paused: bool, n: usize) {
        match status {
            TaskStatus::Queued => {
                self.queued += n;
                if paused {
                    self.paused += n;
                }
            }
            TaskStatus::Running => self.running += n,
            TaskStatus::Success => self.success += n,
            TaskStatus::Failed => self.failed += n,
            TaskStatus::Canceled => self.canceled += n,
        }
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TaskRecord>) -> Self {
        let mut counts = Self::default();
        for r in records {
            counts.record(r.status, r.paused);
        }
        counts
    }

    /// Nothing left that a worker could still pick up or finish.
    pub fn is_drained(&self) -> bool {
        self.queued == 0 && self.running == 0
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.success + self.failed + self.canceled
    }
}
