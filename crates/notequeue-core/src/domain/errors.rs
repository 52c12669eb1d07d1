//! Errors - キュー操作のエラー型
//!
//! 実行失敗・claim 競合・payload 破損・stale lease・キャンセルは
//! エラーではなく TaskRecord 上に記録される。ここに来るのは
//! ストアや設定などインフラ側の失敗と、呼び出し側の入力ミスだけ。

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Submission payload had no usable `task_id`.
    #[error("payload is missing a non-empty task_id")]
    MissingTaskId,

    /// A stored status column held a value we do not know.
    #[error("invalid task status: {0}")]
    InvalidStatus(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl QueueError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// SQLite reports lock contention as SQLITE_BUSY (5) / SQLITE_LOCKED (6).
    pub fn is_busy(&self) -> bool {
        let QueueError::Database(err) = self else {
            return false;
        };
        if let sqlx::Error::Database(db_err) = err
            && matches!(db_err.code().as_deref(), Some("5") | Some("6"))
        {
            return true;
        }
        let msg = err.to_string().to_ascii_lowercase();
        msg.contains("database is locked") || msg.contains("database is busy")
    }
}
