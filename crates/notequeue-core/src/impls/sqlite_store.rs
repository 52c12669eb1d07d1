//! SqliteTaskStore - SQLite 上の台帳（本番用）
//!
//! # 実装詳細
//! - WAL + synchronous=NORMAL + busy_timeout
//! - claim は `UPDATE ... WHERE status = 'QUEUED' ... RETURNING *` の 1 文。
//!   SQLite は 1 文の更新を原子的に行うので、これが唯一の排他制御
//! - その他の遷移も 1 行 UPDATE。ガード（Expect）は WHERE 句に入れる
//! - 時刻は INTEGER（Unix epoch ミリ秒, UTC）
//! - created_at が同じ行は rowid（挿入順）で並べる
//! - SQLITE_BUSY は指数バックオフ + jitter で再試行

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::random;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, SqlitePool};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::app::status::QueueCounts;
use crate::domain::record::CANCELED;
use crate::domain::{
    Expect, Lease, NewTask, QueueError, Result, Settle, TaskId, TaskRecord, TaskStatus, WorkerId,
};
use crate::ports::TaskStore;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

const BUSY_MAX_RETRIES: usize = 12;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 2000;

fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

async fn retry_on_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_busy() || attempt >= BUSY_MAX_RETRIES {
                    return Err(err);
                }
                let capped_ms = BUSY_BASE_DELAY_MS
                    .saturating_mul(1u64 << attempt)
                    .min(BUSY_MAX_DELAY_MS);
                let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
                let delay = Duration::from_millis((capped_ms + jitter_ms).min(BUSY_MAX_DELAY_MS));

                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    BUSY_MAX_RETRIES
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Row shape of `task_queue`.
#[derive(Debug, FromRow)]
struct TaskRow {
    task_id: String,
    payload_json: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    locked_at: Option<i64>,
    lock_owner: Option<String>,
    paused: bool,
    last_error: Option<String>,
    available_at: i64,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = QueueError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let task_id = TaskId::new(row.task_id)
            .ok_or_else(|| QueueError::Other("blank task_id in task_queue".to_string()))?;
        // A RUNNING row missing either lease column is treated as lease-less;
        // recovery handles it as abandoned.
        let lease = match (row.locked_at, row.lock_owner) {
            (Some(at), Some(owner)) => Some(Lease {
                owner: WorkerId::from_stored(owner),
                locked_at: from_ms(at),
            }),
            _ => None,
        };
        Ok(TaskRecord {
            task_id,
            payload_json: row.payload_json,
            status: row.status.parse()?,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(0),
            lease,
            paused: row.paused,
            last_error: row.last_error,
            available_at: from_ms(row.available_at),
            created_at: from_ms(row.created_at),
            updated_at: from_ms(row.updated_at),
        })
    }
}

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (creating if missing) and migrate.
    ///
    /// # Arguments
    /// * `database_url` - e.g. `sqlite:notequeue.db?mode=rwc`
    /// * `max_connections` - pool size; workers share it
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;

        tracing::info!(
            "Task ledger opened at {} with {} max connections",
            database_url,
            max_connections.max(1)
        );
        Ok(store)
    }

    /// Private in-memory database. One connection that never recycles,
    /// otherwise every new connection would see an empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool. Call [`SqliteTaskStore::migrate`] before use.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn ensure_control_state(&self) -> Result<()> {
        let pool = &self.pool;
        let now = to_ms(Utc::now());
        retry_on_busy("ensure_control_state", || async move {
            sqlx::query(
                "INSERT OR IGNORE INTO task_queue_state (id, is_paused, updated_at) VALUES (1, 0, ?)",
            )
            .bind(now)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn upsert(&self, task: NewTask, now: DateTime<Utc>) -> Result<()> {
        let pool = &self.pool;
        let task = &task;
        let now = to_ms(now);
        retry_on_busy("upsert", || async move {
            sqlx::query(
                r#"
                INSERT INTO task_queue (
                    task_id, payload_json, status, attempts, max_attempts,
                    locked_at, lock_owner, paused, last_error,
                    available_at, created_at, updated_at
                )
                VALUES (?, ?, 'QUEUED', 0, ?, NULL, NULL, 0, NULL, ?, ?, ?)
                ON CONFLICT(task_id) DO UPDATE SET
                    payload_json = excluded.payload_json,
                    status = 'QUEUED',
                    attempts = 0,
                    max_attempts = excluded.max_attempts,
                    locked_at = NULL,
                    lock_owner = NULL,
                    paused = 0,
                    last_error = NULL,
                    available_at = excluded.available_at,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(task.task_id.as_str())
            .bind(task.payload_json.as_str())
            .bind(i64::from(task.max_attempts))
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM task_queue WHERE task_id = ?")
            .bind(task_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(TaskRecord::try_from)
            .transpose()
    }

    async fn next_queued(&self, now: DateTime<Utc>) -> Result<Option<TaskRecord>> {
        sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM task_queue
            WHERE status = 'QUEUED' AND paused = 0 AND available_at <= ?
            ORDER BY created_at ASC, rowid ASC
            LIMIT 1
            "#,
        )
        .bind(to_ms(now))
        .fetch_optional(&self.pool)
        .await?
        .map(TaskRecord::try_from)
        .transpose()
    }

    async fn try_claim(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>> {
        let pool = &self.pool;
        let now = to_ms(now);
        let row = retry_on_busy("try_claim", || async move {
            let row = sqlx::query_as::<_, TaskRow>(
                r#"
                UPDATE task_queue SET
                    status = 'RUNNING',
                    locked_at = ?,
                    lock_owner = ?,
                    attempts = attempts + 1,
                    updated_at = ?
                WHERE task_id = ?
                  AND status = 'QUEUED'
                  AND paused = 0
                  AND attempts < max_attempts
                  AND available_at <= ?
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(owner.as_str())
            .bind(now)
            .bind(task_id.as_str())
            .bind(now)
            .fetch_optional(pool)
            .await?;
            Ok(row)
        })
        .await?;
        row.map(TaskRecord::try_from).transpose()
    }

    async fn settle(
        &self,
        task_id: &TaskId,
        expect: &Expect,
        settle: &Settle,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let set_clause = match settle {
            Settle::Succeed => "status = 'SUCCESS', last_error = NULL",
            Settle::Requeue { .. } => {
                "status = 'QUEUED', last_error = COALESCE(?, last_error), available_at = ?"
            }
            Settle::Fail { .. } => "status = 'FAILED', last_error = ?",
        };
        let guard_clause = match expect {
            Expect::Status(_) => "status = ?",
            Expect::HeldBy(_) => "status = 'RUNNING' AND lock_owner = ?",
            Expect::Unleased => "status = 'RUNNING' AND lock_owner IS NULL",
            Expect::Exhausted => "status = 'QUEUED' AND attempts >= max_attempts",
        };
        let sql = format!(
            "UPDATE task_queue SET {set_clause}, locked_at = NULL, lock_owner = NULL, updated_at = ? \
             WHERE task_id = ? AND {guard_clause}"
        );

        let pool = &self.pool;
        let sql = sql.as_str();
        let now = to_ms(now);
        let affected = retry_on_busy("settle", || async move {
            let mut query = sqlx::query(sql);
            match settle {
                Settle::Succeed => {}
                Settle::Requeue {
                    error,
                    available_at,
                } => {
                    query = query.bind(error.as_deref()).bind(to_ms(*available_at));
                }
                Settle::Fail { error } => {
                    query = query.bind(error.as_str());
                }
            }
            query = query.bind(now).bind(task_id.as_str());
            query = match expect {
                Expect::Status(status) => query.bind(status.as_str()),
                Expect::HeldBy(owner) => query.bind(owner.as_str()),
                Expect::Unleased | Expect::Exhausted => query,
            };
            Ok(query.execute(pool).await?.rows_affected())
        })
        .await?;
        Ok(affected > 0)
    }

    async fn cancel(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<bool> {
        let pool = &self.pool;
        let now = to_ms(now);
        let affected = retry_on_busy("cancel", || async move {
            let done = sqlx::query(
                r#"
                UPDATE task_queue SET
                    status = 'CANCELED',
                    last_error = ?,
                    locked_at = NULL,
                    lock_owner = NULL,
                    updated_at = ?
                WHERE task_id = ?
                "#,
            )
            .bind(CANCELED)
            .bind(now)
            .bind(task_id.as_str())
            .execute(pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await?;
        Ok(affected > 0)
    }

    async fn set_task_paused(
        &self,
        task_id: &TaskId,
        paused: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = if paused {
            "UPDATE task_queue SET paused = 1, updated_at = ? WHERE task_id = ? AND status = 'QUEUED'"
        } else {
            "UPDATE task_queue SET paused = 0, updated_at = ? WHERE task_id = ?"
        };
        let pool = &self.pool;
        let now = to_ms(now);
        let affected = retry_on_busy("set_task_paused", || async move {
            let done = sqlx::query(sql)
                .bind(now)
                .bind(task_id.as_str())
                .execute(pool)
                .await?;
            Ok(done.rows_affected())
        })
        .await?;
        Ok(affected > 0)
    }

    async fn is_queue_paused(&self) -> Result<bool> {
        let paused: Option<bool> =
            sqlx::query_scalar("SELECT is_paused FROM task_queue_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(paused.unwrap_or(false))
    }

    async fn set_queue_paused(&self, paused: bool, now: DateTime<Utc>) -> Result<()> {
        let pool = &self.pool;
        let now = to_ms(now);
        retry_on_busy("set_queue_paused", || async move {
            sqlx::query(
                r#"
                INSERT INTO task_queue_state (id, is_paused, updated_at) VALUES (1, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    is_paused = excluded.is_paused,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(paused)
            .bind(now)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn running(&self) -> Result<Vec<TaskRecord>> {
        sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM task_queue WHERE status = 'RUNNING' ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TaskRecord::try_from)
        .collect()
    }

    async fn count_waiting(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM task_queue WHERE status = 'QUEUED' AND paused = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let rows: Vec<(String, bool, i64)> = sqlx::query_as(
            "SELECT status, paused, COUNT(*) FROM task_queue GROUP BY status, paused",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for (status, paused, n) in rows {
            let status: TaskStatus = status.parse()?;
            counts.add(status, paused, usize::try_from(n).unwrap_or(0));
        }
        counts.queue_paused = self.is_queue_paused().await?;
        Ok(counts)
    }
}
