//! Recovery sweep - 起動時に一度だけ、放棄された lease を回収する
//!
//! # 判定
//! - RUNNING かつ（lease なし または locked_at が lease_timeout より古い）→ 放棄
//! - 放棄 + 試行回数が残っている → QUEUED（即 claim 可能）
//! - 放棄 + 使い切り → FAILED("max attempts exceeded")
//!
//! lease_timeout より長く走る健全なジョブも回収されてしまう（at-least-once）。

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::record::MAX_ATTEMPTS_EXCEEDED;
use crate::domain::{Expect, Result, Settle, TaskRecord};
use crate::ports::TaskStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.requeued + self.failed
    }
}

pub fn is_stale(record: &TaskRecord, now: DateTime<Utc>, lease_timeout: Duration) -> bool {
    match &record.lease {
        None => true,
        Some(lease) => {
            let timeout = TimeDelta::from_std(lease_timeout).unwrap_or(TimeDelta::MAX);
            now.signed_duration_since(lease.locked_at) > timeout
        }
    }
}

pub async fn sweep(
    store: &dyn TaskStore,
    now: DateTime<Utc>,
    lease_timeout: Duration,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for record in store.running().await? {
        if !is_stale(&record, now, lease_timeout) {
            continue;
        }

        let settle = if record.has_attempts_left() {
            Settle::Requeue {
                error: None,
                available_at: now,
            }
        } else {
            Settle::Fail {
                error: MAX_ATTEMPTS_EXCEEDED.to_string(),
            }
        };

        // 観測した lease のままなら回収する
        let expect = match &record.lease {
            Some(lease) => Expect::HeldBy(lease.owner.clone()),
            None => Expect::Unleased,
        };
        let applied = store.settle(&record.task_id, &expect, &settle, now).await?;
        if !applied {
            continue;
        }

        let owner = record
            .lease
            .as_ref()
            .map(|l| l.owner.to_string())
            .unwrap_or_default();
        match settle {
            Settle::Fail { .. } => {
                report.failed += 1;
                warn!(
                    task_id = %record.task_id,
                    owner = %owner,
                    attempts = record.attempts,
                    "abandoned task failed: {}",
                    MAX_ATTEMPTS_EXCEEDED
                );
            }
            _ => {
                report.requeued += 1;
                info!(
                    task_id = %record.task_id,
                    owner = %owner,
                    attempts = record.attempts,
                    "abandoned task requeued"
                );
            }
        }
    }

    if report.total() > 0 {
        info!(
            requeued = report.requeued,
            failed = report.failed,
            "recovery sweep finished"
        );
    }
    Ok(report)
}
