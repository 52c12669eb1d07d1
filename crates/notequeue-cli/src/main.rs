use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, sleep};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notequeue_core::app::{QueueBuilder, QueueConfig, TaskQueue};
use notequeue_core::domain::{NoteRequest, Outcome, TaskId, TaskPayload};
use notequeue_core::impls::SqliteTaskStore;
use notequeue_core::ports::JobExecutor;

const DEFAULT_DATABASE_URL: &str = "sqlite:notequeue.db?mode=rwc";

/// Stand-in for the download → transcribe → summarize pipeline.
/// Fails the first `remaining_failures` calls to exercise retries.
struct DemoNoteExecutor {
    remaining_failures: AtomicU32,
}

impl DemoNoteExecutor {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl JobExecutor for DemoNoteExecutor {
    async fn execute(&self, payload: &TaskPayload) -> Outcome {
        let request: NoteRequest = match payload.decode() {
            Ok(r) => r,
            Err(e) => return Outcome::failure(format!("invalid note request: {e}")),
        };

        if let Ok(left) =
            self.remaining_failures
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
        {
            return Outcome::failure(format!("intentional failure (left={left})"));
        }

        sleep(Duration::from_millis(100)).await;
        info!(
            task_id = %request.task_id,
            platform = %request.platform,
            "note generated for {}",
            request.video_url
        );
        Outcome::success()
    }
}

fn platform_of(url: &str) -> &'static str {
    if url.contains("bilibili.com") {
        "bilibili"
    } else if url.contains("youtube.com") || url.contains("youtu.be") {
        "youtube"
    } else if url.contains("douyin.com") {
        "douyin"
    } else {
        "local"
    }
}

async fn wait_until_drained(queue: &TaskQueue, poll: Duration) -> Result<()> {
    loop {
        let counts = queue.counts().await?;
        if counts.is_drained() {
            return Ok(());
        }
        sleep(poll).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notequeue_core=info,notequeue_cli=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = QueueConfig::from_env().context("reading queue configuration")?;
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    let failures: u32 = std::env::var("DEMO_FAILURES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let pool_size = u32::try_from(config.concurrency + 1).unwrap_or(u32::MAX);
    let store = SqliteTaskStore::connect(&database_url, pool_size)
        .await
        .with_context(|| format!("opening task ledger at {database_url}"))?;

    let poll = config.poll_interval();
    let runtime = QueueBuilder::new(Arc::new(store))
        .config(config)
        .executor(Arc::new(DemoNoteExecutor::new(failures)))
        .build()?;

    if let Some(report) = runtime.start().await? {
        info!(
            requeued = report.requeued,
            failed = report.failed,
            "startup recovery complete"
        );
    }
    let queue = runtime.queue();

    let urls: Vec<String> = std::env::args().skip(1).collect();
    if urls.is_empty() {
        warn!("no video URLs given; only pending tasks from the ledger will run");
    }

    let mut submitted = Vec::with_capacity(urls.len());
    for url in &urls {
        let task_id = TaskId::generate();
        let request = NoteRequest::new(&task_id, url.as_str(), platform_of(url));
        let waiting = queue.enqueue(&request.into_payload()?).await?;
        info!(task_id = %task_id, waiting, "submitted {}", url);
        submitted.push(task_id);
    }

    tokio::select! {
        drained = wait_until_drained(&queue, poll) => drained?,
        _ = tokio::signal::ctrl_c() => warn!("interrupted; stopping workers"),
    }
    runtime.stop().await;

    for task_id in &submitted {
        if let Some(record) = queue.get(task_id).await? {
            println!(
                "{} status={} attempts={}/{} last_error={}",
                record.task_id,
                record.status,
                record.attempts,
                record.max_attempts,
                record.last_error.as_deref().unwrap_or("-")
            );
        }
    }
    println!("counts: {:?}", queue.counts().await?);
    Ok(())
}
