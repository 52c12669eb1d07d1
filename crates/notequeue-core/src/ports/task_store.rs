//! TaskStore port - ジョブ台帳の正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - タスクレコード（状態・試行回数・lease・pause・last_error）
//! - キュー全体の制御状態（global pause フラグ、1 行だけ）
//!
//! # 設計原則
//! - すべての変更は 1 行単位の更新。複数行トランザクションは使わない
//! - claim は条件付き更新（CAS）。同じ QUEUED 行を 2 つのワーカーが見ても、
//!   更新に成功するのは 1 つだけ
//! - Lease の権威はここにある（ヒントチャネルの pop は候補通知に過ぎない）
//! - RUNNING から離れる遷移は必ず lease 列を同じ更新でクリアする

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::app::status::QueueCounts;
use crate::domain::{Expect, NewTask, Result, Settle, TaskId, TaskRecord, WorkerId};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create the control-state row if missing (idempotent).
    async fn ensure_control_state(&self) -> Result<()>;

    /// Insert, or re-arm an existing record in place (status QUEUED,
    /// attempts 0, lease cleared, unpaused, no error). `created_at` is kept.
    async fn upsert(&self, task: NewTask, now: DateTime<Utc>) -> Result<()>;

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>>;

    /// Oldest QUEUED + unpaused record whose backoff has elapsed, in
    /// `created_at` then insertion order. Exhausted records are returned
    /// too so the caller can retire them.
    async fn next_queued(&self, now: DateTime<Utc>) -> Result<Option<TaskRecord>>;

    /// Conditional claim. Succeeds only if the record is still claimable
    /// at update time; returns the record after the claim.
    async fn try_claim(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>>;

    /// Guarded transition; returns whether the guard held.
    async fn settle(
        &self,
        task_id: &TaskId,
        expect: &Expect,
        settle: &Settle,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Unconditional cancel. Returns whether the record exists.
    async fn cancel(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<bool>;

    /// Pausing applies only to QUEUED records; resuming applies to any.
    async fn set_task_paused(
        &self,
        task_id: &TaskId,
        paused: bool,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn is_queue_paused(&self) -> Result<bool>;

    async fn set_queue_paused(&self, paused: bool, now: DateTime<Utc>) -> Result<()>;

    /// Every RUNNING record (recovery sweep input).
    async fn running(&self) -> Result<Vec<TaskRecord>>;

    /// QUEUED and unpaused records.
    async fn count_waiting(&self) -> Result<usize>;

    async fn counts(&self) -> Result<QueueCounts>;
}
