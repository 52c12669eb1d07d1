//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **SqliteTaskStore**: 本番用の正本（WAL, 1 行 CAS）
//! - **InMemoryTaskStore**: テスト・組み込み用の正本
//! - **InMemoryDeliveryQueue**: プロセス内のヒントチャネル

pub mod inmem_delivery;
pub mod memory_store;
pub mod sqlite_store;

#[cfg(test)]
mod conformance;

pub use self::inmem_delivery::InMemoryDeliveryQueue;
pub use self::memory_store::InMemoryTaskStore;
pub use self::sqlite_store::SqliteTaskStore;
