//! WorkerLoop - タスク実行ループ
//!
//! # 1 周の流れ
//! 1. global pause 中なら poll_interval だけ待って最初から
//! 2. ヒントを短い timeout で待つ → 来たら CAS claim
//! 3. ヒントなし / claim 失敗なら台帳から dequeue
//! 4. claim 直後にキャンセルを確認（唯一のチェックポイント）
//! 5. executor 実行 → finalize
//!
//! # 停止
//! - shutdown は「待ち」の地点（ヒント待ち・pause 待ち・エラー後の待ち）でだけ割り込む
//! - claim や finalize の途中では止めない（RUNNING のまま取り残さないため）
//! - 実行中の executor は最後まで走らせる

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::app::queue::{ClaimedTask, TaskQueue};
use crate::domain::{Result, TaskId, WorkerId};
use crate::ports::JobExecutor;

/// Worker group handle.
/// - `request_shutdown()` で全ワーカーに停止を通知
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    group: Ulid,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers named `<group>-0 .. <group>-(n-1)`.
    pub fn spawn(n: usize, queue: TaskQueue, executor: Arc<dyn JobExecutor>) -> Self {
        let group = Ulid::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for index in 0..n {
            let worker = WorkerId::new(group, index);
            let q = queue.clone();
            let exec = Arc::clone(&executor);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker, q, exec, &mut rx).await;
            });
            joins.push(join);
        }

        info!(group = %group, workers = n, "worker group started");
        Self {
            group,
            shutdown_tx,
            joins,
        }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Request shutdown for all workers. In-flight executor calls finish first.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            if let Err(e) = j.await {
                warn!(group = %self.group, error = %e, "worker task ended abnormally");
            }
        }
        info!(group = %self.group, "worker group stopped");
    }
}

/// Sleep unless shutdown arrives first. Returns false once shutdown is requested.
async fn idle(shutdown_rx: &mut watch::Receiver<bool>, wait: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(wait) => true,
    }
}

async fn worker_loop(
    worker: WorkerId,
    queue: TaskQueue,
    executor: Arc<dyn JobExecutor>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let poll = queue.config().poll_interval();
    debug!(worker = %worker, "worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match queue.is_paused().await {
            Ok(false) => {}
            Ok(true) => {
                if !idle(shutdown_rx, poll).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(worker = %worker, error = %e, "reading pause flag failed");
                if !idle(shutdown_rx, poll).await {
                    break;
                }
                continue;
            }
        }

        // ヒント待ちだけは shutdown と競合させる
        let hint = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            hint = queue.next_hint() => hint,
        };

        match next_task(&queue, &worker, hint).await {
            Ok(Some(claimed)) => run_claimed(&queue, executor.as_ref(), claimed).await,
            Ok(None) => {}
            Err(e) => {
                warn!(worker = %worker, error = %e, "claiming a task failed");
                if !idle(shutdown_rx, poll).await {
                    break;
                }
            }
        }
    }

    debug!(worker = %worker, "worker stopped");
}

async fn next_task(
    queue: &TaskQueue,
    worker: &WorkerId,
    hint: Option<TaskId>,
) -> Result<Option<ClaimedTask>> {
    if let Some(task_id) = hint {
        if let Some(claimed) = queue.claim_hinted(&task_id, worker).await? {
            return Ok(Some(claimed));
        }
        debug!(worker = %worker, task_id = %task_id, "hint did not yield a claim");
    }
    queue.dequeue(worker).await
}

async fn run_claimed(queue: &TaskQueue, executor: &dyn JobExecutor, claimed: ClaimedTask) {
    let task_id = claimed.task_id().clone();

    match queue.is_canceled(&task_id).await {
        Ok(true) => {
            if let Err(e) = queue.finalize_canceled(&claimed).await {
                warn!(task_id = %task_id, error = %e, "settling canceled task failed");
            }
            return;
        }
        Ok(false) => {}
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "cancel check failed, executing anyway");
        }
    }

    info!(
        task_id = %task_id,
        worker = %claimed.owner,
        attempt = claimed.record.attempts,
        max_attempts = claimed.record.max_attempts,
        "executing task"
    );
    let outcome = executor.execute(&claimed.payload).await;
    if !outcome.is_success() {
        warn!(
            task_id = %task_id,
            attempt = claimed.record.attempts,
            reason = %outcome.error_message(),
            "executor reported failure"
        );
    }

    if let Err(e) = queue.finalize(&claimed, &outcome).await {
        // 台帳には RUNNING のまま残る。次回起動時の回収に任せる
        warn!(task_id = %task_id, error = %e, "finalizing task failed");
    }
}
