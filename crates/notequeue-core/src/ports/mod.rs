//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（SQLite, プロセス内チャネル, ノート生成器）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - DeliveryQueue はヒント（task_id のみ、best-effort）
//! - JobExecutor はキューから見て不透明

pub mod clock;
pub mod delivery_queue;
pub mod executor;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::delivery_queue::DeliveryQueue;
pub use self::executor::{BlockingExecutor, JobExecutor};
pub use self::task_store::TaskStore;
