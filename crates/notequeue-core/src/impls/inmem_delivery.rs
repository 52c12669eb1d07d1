//! InMemoryDeliveryQueue - プロセス内のヒントチャネル
//!
//! # 学習ポイント
//! - tokio::sync::Mutex + Notify による async な blocking pop
//! - Notified を先に enable してから中身を確認する（通知の取りこぼし防止）

use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::TaskId;
use crate::ports::DeliveryQueue;

/// InMemoryDeliveryQueue は task_id だけを運ぶ FIFO
///
/// # 実装詳細
/// - VecDeque<TaskId> を Mutex で保護
/// - push ごとに notify_one で待機中の pop を 1 つ起こす
/// - プロセスが落ちれば中身は消える（台帳の QUEUED 行が残っているので問題ない）
///
/// # 使用例
/// ```ignore
/// let hints = InMemoryDeliveryQueue::new();
/// hints.push(task_id).await;
/// let next = hints.pop(Duration::from_millis(500)).await;
/// ```
#[derive(Default)]
pub struct InMemoryDeliveryQueue {
    hints: Mutex<VecDeque<TaskId>>,
    notify: Notify,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn push(&self, task_id: TaskId) {
        self.hints.lock().await.push_back(task_id);
        self.notify.notify_one();
    }

    async fn pop(&self, timeout: Duration) -> Option<TaskId> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task_id) = self.hints.lock().await.pop_front() {
                return Some(task_id);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // 期限切れ直前に push されたものは拾っておく
                return self.hints.lock().await.pop_front();
            }
        }
    }

    async fn len(&self) -> usize {
        self.hints.lock().await.len()
    }
}
