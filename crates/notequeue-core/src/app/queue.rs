//! TaskQueue - 投入・取得・確定・制御プレーンの窓口
//!
//! # 責務
//! - enqueue: 台帳へ upsert してからヒントを push
//! - dequeue / claim_hinted: どちらも TaskStore::try_claim（CAS）を通ったものだけが所有
//! - finalize: lease 保持者ガード付きで SUCCESS / 再投入 / FAILED
//! - cancel / pause / resume: 1 行更新
//!
//! TaskQueue は Clone 可能なハンドル。プロセス全体のシングルトンは持たない。

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::app::config::QueueConfig;
use crate::app::recovery::{self, RecoveryReport};
use crate::app::retry::RetryPolicy;
use crate::app::status::QueueCounts;
use crate::domain::record::{CANCELED, MAX_ATTEMPTS_EXCEEDED, PAYLOAD_PARSE_FAILURE};
use crate::domain::{
    Expect, NewTask, Outcome, QueueError, Result, Settle, TaskId, TaskPayload, TaskRecord,
    TaskStatus, WorkerId,
};
use crate::ports::{Clock, DeliveryQueue, TaskStore};

/// A record this worker owns until it is finalized.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    /// Record as returned by the claim (status RUNNING, attempts already bumped).
    pub record: TaskRecord,
    pub payload: TaskPayload,
    pub owner: WorkerId,
}

impl ClaimedTask {
    pub fn task_id(&self) -> &TaskId {
        &self.record.task_id
    }
}

struct Inner {
    store: Arc<dyn TaskStore>,
    delivery: Arc<dyn DeliveryQueue>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    retry: RetryPolicy,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        delivery: Arc<dyn DeliveryQueue>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                delivery,
                clock,
                config,
                retry,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    // ---- submission ----

    /// Durably (re-)arm the task, then hint a worker.
    ///
    /// Returns the number of QUEUED, unpaused records afterwards. A payload
    /// without `task_id` is rejected with [`QueueError::MissingTaskId`] and
    /// nothing is written.
    pub async fn enqueue(&self, payload: &TaskPayload) -> Result<usize> {
        let task_id = payload.task_id().ok_or(QueueError::MissingTaskId)?;
        let max_attempts = payload
            .max_attempts()
            .unwrap_or(self.inner.config.default_max_attempts);

        self.inner
            .store
            .upsert(
                NewTask {
                    task_id: task_id.clone(),
                    payload_json: payload.to_json()?,
                    max_attempts,
                },
                self.now(),
            )
            .await?;
        info!(task_id = %task_id, max_attempts, "task queued");

        self.inner.delivery.push(task_id).await;
        self.inner.store.count_waiting().await
    }

    // ---- claim ----

    /// Durable path: oldest eligible record, claimed by CAS.
    ///
    /// An exhausted record found at the head is retired to FAILED on the
    /// spot and this call returns `None`.
    pub async fn dequeue(&self, worker: &WorkerId) -> Result<Option<ClaimedTask>> {
        if self.inner.store.is_queue_paused().await? {
            return Ok(None);
        }
        let now = self.now();
        let Some(head) = self.inner.store.next_queued(now).await? else {
            return Ok(None);
        };

        if !head.has_attempts_left() {
            let retired = self
                .inner
                .store
                .settle(
                    &head.task_id,
                    &Expect::Exhausted,
                    &Settle::Fail {
                        error: MAX_ATTEMPTS_EXCEEDED.to_string(),
                    },
                    now,
                )
                .await?;
            if retired {
                info!(
                    task_id = %head.task_id,
                    attempts = head.attempts,
                    "task failed: {}",
                    MAX_ATTEMPTS_EXCEEDED
                );
            }
            return Ok(None);
        }

        self.claim(&head.task_id, worker, now).await
    }

    /// Hint path. The hint carries no ownership; the same CAS decides.
    pub async fn claim_hinted(
        &self,
        task_id: &TaskId,
        worker: &WorkerId,
    ) -> Result<Option<ClaimedTask>> {
        if self.inner.store.is_queue_paused().await? {
            return Ok(None);
        }
        self.claim(task_id, worker, self.now()).await
    }

    /// Wait up to `hint_timeout` for a hinted task id.
    pub async fn next_hint(&self) -> Option<TaskId> {
        self.inner
            .delivery
            .pop(self.inner.config.hint_timeout())
            .await
    }

    async fn claim(
        &self,
        task_id: &TaskId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedTask>> {
        let Some(record) = self.inner.store.try_claim(task_id, worker, now).await? else {
            debug!(task_id = %task_id, worker = %worker, "claim lost or task not claimable");
            return Ok(None);
        };
        debug!(
            task_id = %task_id,
            worker = %worker,
            attempt = record.attempts,
            "task claimed"
        );

        match TaskPayload::parse(&record.payload_json) {
            Ok(payload) => Ok(Some(ClaimedTask {
                record,
                payload,
                owner: worker.clone(),
            })),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "stored payload is not a JSON object");
                self.inner
                    .store
                    .settle(
                        task_id,
                        &Expect::HeldBy(worker.clone()),
                        &Settle::Fail {
                            error: PAYLOAD_PARSE_FAILURE.to_string(),
                        },
                        self.now(),
                    )
                    .await?;
                Ok(None)
            }
        }
    }

    // ---- finalize ----

    /// Cancellation checkpoint, read straight from the ledger.
    pub async fn is_canceled(&self, task_id: &TaskId) -> Result<bool> {
        Ok(self
            .inner
            .store
            .get(task_id)
            .await?
            .is_some_and(|r| r.status == TaskStatus::Canceled))
    }

    /// Settle a claimed-then-canceled task as FAILED("canceled") without running it.
    pub async fn finalize_canceled(&self, claimed: &ClaimedTask) -> Result<bool> {
        let settled = self
            .inner
            .store
            .settle(
                claimed.task_id(),
                &Expect::Status(TaskStatus::Canceled),
                &Settle::Fail {
                    error: CANCELED.to_string(),
                },
                self.now(),
            )
            .await?;
        if settled {
            info!(task_id = %claimed.task_id(), "task canceled before execution");
        }
        Ok(settled)
    }

    /// Record the executor outcome.
    ///
    /// A failure with attempts left goes back to QUEUED after the retry
    /// delay; otherwise it is FAILED. Returns the status written, or `None`
    /// when this worker no longer holds the lease (e.g. canceled meanwhile).
    pub async fn finalize(
        &self,
        claimed: &ClaimedTask,
        outcome: &Outcome,
    ) -> Result<Option<TaskStatus>> {
        let now = self.now();
        let record = &claimed.record;
        let settle = if outcome.is_success() {
            Settle::Succeed
        } else if record.has_attempts_left() {
            let delay = self.inner.retry.next_delay(record.attempts);
            let available_at = TimeDelta::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(now);
            Settle::Requeue {
                error: Some(outcome.error_message()),
                available_at,
            }
        } else {
            Settle::Fail {
                error: outcome.error_message(),
            }
        };

        let applied = self
            .inner
            .store
            .settle(
                claimed.task_id(),
                &Expect::HeldBy(claimed.owner.clone()),
                &settle,
                now,
            )
            .await?;
        if !applied {
            info!(
                task_id = %claimed.task_id(),
                worker = %claimed.owner,
                "lease no longer held, outcome discarded"
            );
            return Ok(None);
        }

        let status = settle.status();
        match &settle {
            Settle::Succeed => info!(task_id = %claimed.task_id(), attempts = record.attempts, "task succeeded"),
            Settle::Requeue { available_at, .. } => info!(
                task_id = %claimed.task_id(),
                attempts = record.attempts,
                max_attempts = record.max_attempts,
                retry_at = %available_at,
                "task requeued for retry"
            ),
            Settle::Fail { error } => info!(
                task_id = %claimed.task_id(),
                attempts = record.attempts,
                "task failed: {}",
                error
            ),
        }
        Ok(Some(status))
    }

    // ---- control plane ----

    /// Cancel from any status. Returns whether the record exists.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<bool> {
        let found = self.inner.store.cancel(task_id, self.now()).await?;
        if found {
            info!(task_id = %task_id, "task canceled");
        }
        Ok(found)
    }

    pub async fn pause_queue(&self) -> Result<()> {
        self.inner.store.set_queue_paused(true, self.now()).await?;
        info!("queue paused");
        Ok(())
    }

    pub async fn resume_queue(&self) -> Result<()> {
        self.inner.store.set_queue_paused(false, self.now()).await?;
        info!("queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool> {
        self.inner.store.is_queue_paused().await
    }

    /// Only a QUEUED record can be paused.
    pub async fn pause_task(&self, task_id: &TaskId) -> Result<bool> {
        self.inner
            .store
            .set_task_paused(task_id, true, self.now())
            .await
    }

    pub async fn resume_task(&self, task_id: &TaskId) -> Result<bool> {
        self.inner
            .store
            .set_task_paused(task_id, false, self.now())
            .await
    }

    // ---- inspection ----

    /// QUEUED and unpaused records, backing-off ones included.
    pub async fn size(&self) -> Result<usize> {
        self.inner.store.count_waiting().await
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>> {
        self.inner.store.get(task_id).await
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        self.inner.store.counts().await
    }

    // ---- lifecycle ----

    pub(crate) async fn prepare(&self) -> Result<RecoveryReport> {
        self.inner.store.ensure_control_state().await?;
        recovery::sweep(
            self.inner.store.as_ref(),
            self.now(),
            self.inner.config.lease_timeout(),
        )
        .await
    }
}
