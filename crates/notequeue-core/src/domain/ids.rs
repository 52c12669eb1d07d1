//! Domain identifiers.
//!
//! # TaskId
//! タスク ID は呼び出し側が決める文字列（HTTP 層が UUID を渡してくる等）。
//! 再投入（retry）は同じ TaskId を再利用するので、キューは値の形式を仮定しない。
//! 呼び出し側が ID を持っていない場合のために ULID で生成もできる。
//!
//! # WorkerId
//! `<group>-<index>` 形式。group はプロセス起動ごとの ULID で、
//! lease の `lock_owner` に記録される。

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identifier of a task record (primary key of the ledger).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wrap a caller-supplied id. Returns `None` for empty / blank input.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Generate a fresh, time-sortable id.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of one worker; stored as the lease owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(group: Ulid, index: usize) -> Self {
        Self(format!("{}-{}", group.to_string().to_ascii_lowercase(), index))
    }

    /// Rebuild from a stored `lock_owner` value.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
