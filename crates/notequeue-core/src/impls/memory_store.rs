//! InMemoryTaskStore - テスト・組み込み用の台帳
//!
//! # 実装詳細
//! - HashMap<TaskId, Entry> を tokio::sync::Mutex で保護
//! - 1 回のロック区間 = 1 行更新。ロックを握ったまま await しない
//! - 挿入順の連番で created_at 同値時の順序を決める（SQLite の rowid に相当）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::app::status::QueueCounts;
use crate::domain::{
    Expect, NewTask, Result, Settle, TaskId, TaskRecord, TaskStatus, WorkerId,
};
use crate::ports::TaskStore;

struct Entry {
    seq: u64,
    record: TaskRecord,
}

#[derive(Default)]
struct State {
    records: HashMap<TaskId, Entry>,
    queue_paused: bool,
    next_seq: u64,
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<State>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn ensure_control_state(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, task: NewTask, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.records.get_mut(&task.task_id) {
            entry.record.rearm(task, now);
            return Ok(());
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let task_id = task.task_id.clone();
        state.records.insert(
            task_id,
            Entry {
                seq,
                record: TaskRecord::new(task, now),
            },
        );
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>> {
        let state = self.state.lock().await;
        Ok(state.records.get(task_id).map(|e| e.record.clone()))
    }

    async fn next_queued(&self, now: DateTime<Utc>) -> Result<Option<TaskRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|e| e.record.is_waiting() && e.record.available_at <= now)
            .min_by_key(|e| (e.record.created_at, e.seq))
            .map(|e| e.record.clone()))
    }

    async fn try_claim(
        &self,
        task_id: &TaskId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.records.get_mut(task_id) else {
            return Ok(None);
        };
        if !entry.record.is_claimable(now) {
            return Ok(None);
        }
        entry.record.claim(owner.clone(), now);
        Ok(Some(entry.record.clone()))
    }

    async fn settle(
        &self,
        task_id: &TaskId,
        expect: &Expect,
        settle: &Settle,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.records.get_mut(task_id) {
            Some(entry) if expect.matches(&entry.record) => {
                entry.record.settle(settle, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.records.get_mut(task_id) {
            Some(entry) => {
                entry.record.cancel(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_task_paused(
        &self,
        task_id: &TaskId,
        paused: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.records.get_mut(task_id) else {
            return Ok(false);
        };
        if paused && entry.record.status != TaskStatus::Queued {
            return Ok(false);
        }
        entry.record.paused = paused;
        entry.record.updated_at = now;
        Ok(true)
    }

    async fn is_queue_paused(&self) -> Result<bool> {
        Ok(self.state.lock().await.queue_paused)
    }

    async fn set_queue_paused(&self, paused: bool, _now: DateTime<Utc>) -> Result<()> {
        self.state.lock().await.queue_paused = paused;
        Ok(())
    }

    async fn running(&self) -> Result<Vec<TaskRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|e| e.record.status == TaskStatus::Running)
            .map(|e| e.record.clone())
            .collect())
    }

    async fn count_waiting(&self) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|e| e.record.is_waiting())
            .count())
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::from_records(state.records.values().map(|e| &e.record));
        counts.queue_paused = state.queue_paused;
        Ok(counts)
    }
}
