//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **QueueBuilder / QueueRuntime**: 構築・起動・停止
//! - **TaskQueue**: 投入・claim・確定・制御プレーン
//! - **WorkerGroup**: タスク実行ループ（hint→claim→cancel check→execute→finalize）
//! - **recovery**: 起動時の stale lease 回収
//! - **QueueConfig / RetryPolicy**: 設定とバックオフ

pub mod config;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod runtime;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::config::QueueConfig;
pub use self::queue::{ClaimedTask, TaskQueue};
pub use self::recovery::RecoveryReport;
pub use self::retry::RetryPolicy;
pub use self::runtime::{QueueBuilder, QueueRuntime};
pub use self::status::QueueCounts;
pub use self::worker_loop::WorkerGroup;
