//! DeliveryQueue port - ヒントチャネル（プロセス内 best-effort）
//!
//! DeliveryQueue は task_id のみを流します（状態や payload は含まない）。
//!
//! # 設計原則
//! - 正本ではない。pop した task_id も TaskStore::try_claim に通るまでは所有ではない
//! - 取りこぼし・重複・クラッシュ時の消失はすべて許容（台帳がすでに QUEUED を持っている）
//! - blocking pop（timeout 付き）

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::TaskId;

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Best-effort notify; never fails the submission.
    async fn push(&self, task_id: TaskId);

    /// Wait up to `timeout` for a hint.
    async fn pop(&self, timeout: Duration) -> Option<TaskId>;

    /// Hints currently buffered.
    async fn len(&self) -> usize;
}
