//! QueueRuntime - キューの構築と起動・停止
//!
//! # 学習ポイント
//! - Builder パターン（store 以外はすべて省略可能、executor だけ必須）
//! - 起動時検証（Fail-fast）
//! - グローバル変数を持たない明示的なライフサイクル
//!
//! # start() の順序
//! 1. 制御行（global pause）を用意
//! 2. recovery sweep を 1 回
//! 3. concurrency 個のワーカーを起動

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::app::config::QueueConfig;
use crate::app::queue::TaskQueue;
use crate::app::recovery::RecoveryReport;
use crate::app::retry::RetryPolicy;
use crate::app::worker_loop::WorkerGroup;
use crate::domain::{QueueError, Result};
use crate::impls::InMemoryDeliveryQueue;
use crate::ports::{Clock, DeliveryQueue, JobExecutor, SystemClock, TaskStore};

/// QueueBuilder は QueueRuntime を構築
///
/// # 使用例
/// ```ignore
/// let runtime = QueueBuilder::new(Arc::new(store))
///     .config(QueueConfig::from_env()?)
///     .executor(Arc::new(NoteExecutor::new()))
///     .build()?;
/// runtime.start().await?;
/// runtime.queue().enqueue(&payload).await?;
/// runtime.stop().await;
/// ```
pub struct QueueBuilder {
    store: Arc<dyn TaskStore>,
    delivery: Option<Arc<dyn DeliveryQueue>>,
    clock: Option<Arc<dyn Clock>>,
    executor: Option<Arc<dyn JobExecutor>>,
    config: QueueConfig,
    retry: RetryPolicy,
}

impl QueueBuilder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            delivery: None,
            clock: None,
            executor: None,
            config: QueueConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to an [`InMemoryDeliveryQueue`].
    pub fn delivery(mut self, delivery: Arc<dyn DeliveryQueue>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// # 検証
    /// - executor が未設定なら Config エラー
    /// - config は validate() を通す（concurrency は 1 以上に丸める）
    pub fn build(self) -> Result<QueueRuntime> {
        let executor = self
            .executor
            .ok_or_else(|| QueueError::config("an executor must be set before build()"))?;
        let config = self.config.validate()?;
        let delivery: Arc<dyn DeliveryQueue> = match self.delivery {
            Some(delivery) => delivery,
            None => Arc::new(InMemoryDeliveryQueue::new()),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let queue = TaskQueue::new(self.store, delivery, clock, config, self.retry);
        Ok(QueueRuntime {
            queue,
            executor,
            workers: Mutex::new(None),
        })
    }
}

/// Started/stopped explicitly; submissions go through [`QueueRuntime::queue`].
pub struct QueueRuntime {
    queue: TaskQueue,
    executor: Arc<dyn JobExecutor>,
    workers: Mutex<Option<WorkerGroup>>,
}

impl QueueRuntime {
    /// Cloneable handle for submitters and operators.
    pub fn queue(&self) -> TaskQueue {
        self.queue.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    /// Recover, then spawn the workers. A second call while running is a
    /// no-op and returns `None`.
    pub async fn start(&self) -> Result<Option<RecoveryReport>> {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            return Ok(None);
        }

        let report = self.queue.prepare().await?;
        let n = self.queue.config().concurrency;
        *workers = Some(WorkerGroup::spawn(
            n,
            self.queue.clone(),
            Arc::clone(&self.executor),
        ));
        info!(
            concurrency = n,
            recovered = report.total(),
            "task queue started"
        );
        Ok(Some(report))
    }

    /// Stop taking new work and wait for every worker to exit.
    pub async fn stop(&self) {
        let group = self.workers.lock().await.take();
        if let Some(group) = group {
            group.shutdown_and_join().await;
            info!("task queue stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, Outcome, TaskId, TaskPayload, TaskStatus, WorkerId};
    use crate::impls::{InMemoryTaskStore, SqliteTaskStore};
    use crate::ports::{BlockingExecutor, FixedClock};
    use chrono::{TimeDelta, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config(concurrency: usize) -> QueueConfig {
        QueueConfig {
            poll_interval_secs: 0.02,
            hint_timeout_secs: 0.02,
            concurrency,
            ..QueueConfig::default()
        }
    }

    fn payload(v: serde_json::Value) -> TaskPayload {
        TaskPayload::from_value(v).unwrap()
    }

    fn id(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    fn counting(calls: &Arc<AtomicUsize>, outcome: fn(usize) -> Outcome) -> Arc<dyn JobExecutor> {
        let calls = Arc::clone(calls);
        Arc::new(BlockingExecutor::new(move |_p: TaskPayload| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            outcome(n)
        }))
    }

    async fn wait_for(queue: &TaskQueue, task: &str, status: TaskStatus) {
        for _ in 0..500 {
            if let Some(r) = queue.get(&id(task)).await.unwrap()
                && r.status == status
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "{task} never reached {status}: {:?}",
            queue.get(&id(task)).await.unwrap()
        );
    }

    #[test]
    fn build_requires_an_executor() {
        let err = QueueBuilder::new(Arc::new(InMemoryTaskStore::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_joins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let runtime = QueueBuilder::new(Arc::new(InMemoryTaskStore::new()))
            .config(fast_config(2))
            .executor(counting(&calls, |_| Outcome::success()))
            .build()
            .unwrap();

        assert!(runtime.start().await.unwrap().is_some());
        assert!(runtime.start().await.unwrap().is_none());
        assert!(runtime.is_running().await);

        runtime.stop().await;
        assert!(!runtime.is_running().await);
        runtime.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fails_twice_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let runtime = QueueBuilder::new(Arc::new(InMemoryTaskStore::new()))
            .config(fast_config(1))
            .retry_policy(RetryPolicy::immediate())
            .executor(counting(&calls, |n| {
                if n < 3 {
                    Outcome::failure(format!("transient #{n}"))
                } else {
                    Outcome::success()
                }
            }))
            .build()
            .unwrap();
        runtime.start().await.unwrap();

        let queue = runtime.queue();
        queue
            .enqueue(&payload(json!({"task_id": "t1", "max_attempts": 3})))
            .await
            .unwrap();
        wait_for(&queue, "t1", TaskStatus::Success).await;
        runtime.stop().await;

        let r = queue.get(&id("t1")).await.unwrap().unwrap();
        assert_eq!(r.attempts, 3);
        assert!(r.last_error.is_none());
        assert!(r.lease.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_attempt_failure_is_final() {
        let calls = Arc::new(AtomicUsize::new(0));
        let runtime = QueueBuilder::new(Arc::new(InMemoryTaskStore::new()))
            .config(fast_config(2))
            .retry_policy(RetryPolicy::immediate())
            .executor(counting(&calls, |_| Outcome::failure("always broken")))
            .build()
            .unwrap();
        runtime.start().await.unwrap();

        let queue = runtime.queue();
        queue
            .enqueue(&payload(json!({"task_id": "t1", "max_attempts": 1})))
            .await
            .unwrap();
        wait_for(&queue, "t1", TaskStatus::Failed).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        runtime.stop().await;

        let r = queue.get(&id("t1")).await.unwrap().unwrap();
        assert_eq!(r.attempts, 1);
        assert_eq!(r.last_error.as_deref(), Some("always broken"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn global_pause_holds_everything_until_resume() {
        let calls = Arc::new(AtomicUsize::new(0));
        let runtime = QueueBuilder::new(Arc::new(InMemoryTaskStore::new()))
            .config(fast_config(2))
            .executor(counting(&calls, |_| Outcome::success()))
            .build()
            .unwrap();
        let queue = runtime.queue();
        queue.pause_queue().await.unwrap();
        for i in 0..4 {
            queue
                .enqueue(&payload(json!({"task_id": format!("t{i}")})))
                .await
                .unwrap();
        }
        runtime.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.queued, 4);
        assert_eq!(counts.running, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        queue.resume_queue().await.unwrap();
        for i in 0..4 {
            wait_for(&queue, &format!("t{i}"), TaskStatus::Success).await;
        }
        runtime.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn canceled_before_pickup_never_executes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let runtime = QueueBuilder::new(Arc::new(InMemoryTaskStore::new()))
            .config(fast_config(1))
            .executor(counting(&calls, |_| Outcome::success()))
            .build()
            .unwrap();
        let queue = runtime.queue();
        queue.enqueue(&payload(json!({"task_id": "t1"}))).await.unwrap();
        assert!(queue.cancel(&id("t1")).await.unwrap());

        runtime.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        runtime.stop().await;

        let r = queue.get(&id("t1")).await.unwrap().unwrap();
        assert_eq!(r.status, TaskStatus::Canceled);
        assert_eq!(r.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_recovers_abandoned_leases_before_working() {
        let store = Arc::new(InMemoryTaskStore::new());
        let crashed_at = Utc::now() - TimeDelta::hours(1);
        for (name, max_attempts) in [("retry-me", 3), ("spent", 1)] {
            store
                .upsert(
                    NewTask {
                        task_id: id(name),
                        payload_json: json!({"task_id": name}).to_string(),
                        max_attempts,
                    },
                    crashed_at,
                )
                .await
                .unwrap();
            store
                .try_claim(&id(name), &WorkerId::from_stored("crashed-0"), crashed_at)
                .await
                .unwrap()
                .unwrap();
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let runtime = QueueBuilder::new(store)
            .config(fast_config(1))
            .executor(counting(&calls, |_| Outcome::success()))
            .build()
            .unwrap();
        let report = runtime.start().await.unwrap().unwrap();
        assert_eq!(report, RecoveryReport { requeued: 1, failed: 1 });

        let queue = runtime.queue();
        wait_for(&queue, "retry-me", TaskStatus::Success).await;
        runtime.stop().await;

        let retried = queue.get(&id("retry-me")).await.unwrap().unwrap();
        assert_eq!(retried.attempts, 2);
        let spent = queue.get(&id("spent")).await.unwrap().unwrap();
        assert_eq!(spent.status, TaskStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovery_uses_the_injected_clock() {
        let start = Utc::now();
        let clock = Arc::new(FixedClock::new(start));
        let store = Arc::new(InMemoryTaskStore::new());
        store
            .upsert(
                NewTask {
                    task_id: id("t1"),
                    payload_json: r#"{"task_id":"t1"}"#.into(),
                    max_attempts: 3,
                },
                start,
            )
            .await
            .unwrap();
        store
            .try_claim(&id("t1"), &WorkerId::from_stored("w-0"), start)
            .await
            .unwrap()
            .unwrap();

        let build = |clock: Arc<FixedClock>| {
            QueueBuilder::new(store.clone())
                .config(fast_config(1))
                .clock(clock)
                .executor(Arc::new(BlockingExecutor::new(|_p: TaskPayload| {
                    Outcome::success()
                })))
                .build()
                .unwrap()
        };

        clock.advance(TimeDelta::seconds(599));
        let early = build(clock.clone());
        assert_eq!(early.start().await.unwrap().unwrap().total(), 0);
        early.stop().await;

        clock.advance(TimeDelta::seconds(2));
        let late = build(clock.clone());
        assert_eq!(late.start().await.unwrap().unwrap().requeued, 1);
        late.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sqlite_workers_never_double_execute() {
        let dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite:{}?mode=rwc",
            dir.path().join("queue.db").to_string_lossy().replace('\\', "/")
        );
        let store = Arc::new(SqliteTaskStore::connect(&url, 4).await.unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let runtime = QueueBuilder::new(store)
            .config(fast_config(4))
            .executor(counting(&calls, |_| Outcome::success()))
            .build()
            .unwrap();
        runtime.start().await.unwrap();

        let queue = runtime.queue();
        queue.enqueue(&payload(json!({"task_id": "only"}))).await.unwrap();
        wait_for(&queue, "only", TaskStatus::Success).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        runtime.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.get(&id("only")).await.unwrap().unwrap().attempts, 1);
    }
}
