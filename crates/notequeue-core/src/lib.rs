//! notequeue-core
//!
//! Persistent task queue for long-running video-to-note jobs.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, record, payload, outcome, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, DeliveryQueue, JobExecutor, Clock）
//! - **impls**: 実装（SqliteTaskStore, InMemoryTaskStore, InMemoryDeliveryQueue）
//! - **app**: アプリケーションロジック（queue, worker_loop, recovery, runtime, config, status）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
