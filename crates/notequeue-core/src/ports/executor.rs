//! JobExecutor port - 実際のノート生成（ダウンロード・文字起こし・要約）
//!
//! キューから見ると不透明な同期呼び出し。payload を受け取り、成否を返す。
//!
//! # 契約
//! - 同じ payload で何度呼ばれても安全であること（リトライ・復旧後の再 claim）
//! - 呼び出しが終わったら payload を保持しないこと
//! - 実行中のキャンセルは届かない（協調的キャンセルは claim 直後の 1 回だけ）

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{Outcome, TaskPayload};

#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, payload: &TaskPayload) -> Outcome;
}

/// Adapts a blocking closure (e.g. an FFmpeg + whisper pipeline) by running
/// it on the blocking thread pool, so workers never stall the runtime.
pub struct BlockingExecutor<F> {
    f: Arc<F>,
}

impl<F> BlockingExecutor<F>
where
    F: Fn(TaskPayload) -> Outcome + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl<F> JobExecutor for BlockingExecutor<F>
where
    F: Fn(TaskPayload) -> Outcome + Send + Sync + 'static,
{
    async fn execute(&self, payload: &TaskPayload) -> Outcome {
        let f = Arc::clone(&self.f);
        let payload = payload.clone();
        match tokio::task::spawn_blocking(move || f(payload)).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::failure(format!("executor panicked: {e}")),
        }
    }
}
