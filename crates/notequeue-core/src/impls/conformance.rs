//! 両ストア共通の振る舞いテスト

use chrono::{Duration, TimeZone, Utc};
use rstest::rstest;

use crate::domain::record::CANCELED;
use crate::domain::{Expect, NewTask, Settle, TaskId, TaskStatus, WorkerId};
use crate::ports::TaskStore;

use super::{InMemoryTaskStore, SqliteTaskStore};

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    Sqlite,
}

async fn open(backend: Backend) -> Box<dyn TaskStore> {
    match backend {
        Backend::Memory => Box::new(InMemoryTaskStore::new()),
        Backend::Sqlite => Box::new(SqliteTaskStore::open_in_memory().await.unwrap()),
    }
}

fn id(s: &str) -> TaskId {
    TaskId::new(s).unwrap()
}

fn task(s: &str, max_attempts: u32) -> NewTask {
    NewTask {
        task_id: id(s),
        payload_json: format!(r#"{{"task_id":"{s}"}}"#),
        max_attempts,
    }
}

fn worker(n: u32) -> WorkerId {
    WorkerId::from_stored(format!("g-{n}"))
}

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn upsert_creates_queued_record(#[case] backend: Backend) {
    let store = open(backend).await;
    store.upsert(task("t1", 3), t0()).await.unwrap();

    let r = store.get(&id("t1")).await.unwrap().unwrap();
    assert_eq!(r.status, TaskStatus::Queued);
    assert_eq!(r.attempts, 0);
    assert_eq!(r.max_attempts, 3);
    assert!(r.lease.is_none());
    assert!(!r.paused);
    assert_eq!(r.created_at, t0());
    assert_eq!(store.count_waiting().await.unwrap(), 1);
    assert!(store.get(&id("missing")).await.unwrap().is_none());
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn next_queued_is_fifo_with_insertion_tie_break(#[case] backend: Backend) {
    let store = open(backend).await;
    store.upsert(task("late", 3), t0() + Duration::seconds(1)).await.unwrap();
    store.upsert(task("b", 3), t0()).await.unwrap();
    store.upsert(task("a", 3), t0()).await.unwrap();

    let now = t0() + Duration::seconds(5);
    let first = store.next_queued(now).await.unwrap().unwrap();
    assert_eq!(first.task_id, id("b"));

    store.try_claim(&id("b"), &worker(0), now).await.unwrap().unwrap();
    let second = store.next_queued(now).await.unwrap().unwrap();
    assert_eq!(second.task_id, id("a"));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn claim_is_exclusive(#[case] backend: Backend) {
    let store = open(backend).await;
    store.upsert(task("t1", 3), t0()).await.unwrap();

    let claimed = store.try_claim(&id("t1"), &worker(0), t0()).await.unwrap().unwrap();
    assert_eq!(claimed.status, TaskStatus::Running);
    assert_eq!(claimed.attempts, 1);
    let lease = claimed.lease.unwrap();
    assert_eq!(lease.owner, worker(0));
    assert_eq!(lease.locked_at, t0());

    assert!(store.try_claim(&id("t1"), &worker(1), t0()).await.unwrap().is_none());
    assert!(store.next_queued(t0()).await.unwrap().is_none());
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn claim_respects_pause_budget_and_backoff(#[case] backend: Backend) {
    let store = open(backend).await;

    store.upsert(task("paused", 3), t0()).await.unwrap();
    assert!(store.set_task_paused(&id("paused"), true, t0()).await.unwrap());
    assert!(store.try_claim(&id("paused"), &worker(0), t0()).await.unwrap().is_none());
    assert!(store.next_queued(t0()).await.unwrap().is_none());
    assert_eq!(store.count_waiting().await.unwrap(), 0);

    store.upsert(task("spent", 0), t0()).await.unwrap();
    assert!(store.try_claim(&id("spent"), &worker(0), t0()).await.unwrap().is_none());
    // exhausted records are still surfaced so the caller can retire them
    assert_eq!(
        store.next_queued(t0()).await.unwrap().unwrap().task_id,
        id("spent")
    );

    store.upsert(task("later", 3), t0()).await.unwrap();
    store.try_claim(&id("later"), &worker(0), t0()).await.unwrap().unwrap();
    let retry_at = t0() + Duration::seconds(30);
    assert!(
        store
            .settle(
                &id("later"),
                &Expect::HeldBy(worker(0)),
                &Settle::Requeue {
                    error: Some("boom".into()),
                    available_at: retry_at,
                },
                t0(),
            )
            .await
            .unwrap()
    );
    assert!(store.try_claim(&id("later"), &worker(0), t0()).await.unwrap().is_none());
    let again = store.try_claim(&id("later"), &worker(0), retry_at).await.unwrap().unwrap();
    assert_eq!(again.attempts, 2);
    assert_eq!(again.last_error.as_deref(), Some("boom"));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn settle_is_guarded_and_clears_lease(#[case] backend: Backend) {
    let store = open(backend).await;
    store.upsert(task("t1", 3), t0()).await.unwrap();
    store.try_claim(&id("t1"), &worker(0), t0()).await.unwrap().unwrap();

    let wrong_owner = store
        .settle(&id("t1"), &Expect::HeldBy(worker(9)), &Settle::Succeed, t0())
        .await
        .unwrap();
    assert!(!wrong_owner);
    assert_eq!(
        store.get(&id("t1")).await.unwrap().unwrap().status,
        TaskStatus::Running
    );

    let done = store
        .settle(&id("t1"), &Expect::HeldBy(worker(0)), &Settle::Succeed, t0())
        .await
        .unwrap();
    assert!(done);
    let r = store.get(&id("t1")).await.unwrap().unwrap();
    assert_eq!(r.status, TaskStatus::Success);
    assert!(r.lease.is_none());
    assert!(r.last_error.is_none());
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn cancel_wins_over_late_finalize(#[case] backend: Backend) {
    let store = open(backend).await;
    store.upsert(task("t1", 3), t0()).await.unwrap();
    store.try_claim(&id("t1"), &worker(0), t0()).await.unwrap().unwrap();

    assert!(store.cancel(&id("t1"), t0()).await.unwrap());
    let r = store.get(&id("t1")).await.unwrap().unwrap();
    assert_eq!(r.status, TaskStatus::Canceled);
    assert_eq!(r.last_error.as_deref(), Some(CANCELED));
    assert!(r.lease.is_none());

    let late = store
        .settle(&id("t1"), &Expect::HeldBy(worker(0)), &Settle::Succeed, t0())
        .await
        .unwrap();
    assert!(!late);
    assert_eq!(
        store.get(&id("t1")).await.unwrap().unwrap().status,
        TaskStatus::Canceled
    );

    assert!(!store.cancel(&id("missing"), t0()).await.unwrap());
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn resubmission_rearms_and_keeps_created_at(#[case] backend: Backend) {
    let store = open(backend).await;
    store.upsert(task("t1", 1), t0()).await.unwrap();
    store.try_claim(&id("t1"), &worker(0), t0()).await.unwrap().unwrap();
    store
        .settle(
            &id("t1"),
            &Expect::HeldBy(worker(0)),
            &Settle::Fail { error: "boom".into() },
            t0(),
        )
        .await
        .unwrap();

    let later = t0() + Duration::minutes(5);
    store.upsert(task("t1", 4), later).await.unwrap();
    let r = store.get(&id("t1")).await.unwrap().unwrap();
    assert_eq!(r.status, TaskStatus::Queued);
    assert_eq!(r.attempts, 0);
    assert_eq!(r.max_attempts, 4);
    assert!(r.last_error.is_none());
    assert!(r.lease.is_none());
    assert_eq!(r.created_at, t0());
    assert_eq!(r.updated_at, later);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn task_pause_only_applies_to_queued(#[case] backend: Backend) {
    let store = open(backend).await;
    store.upsert(task("t1", 3), t0()).await.unwrap();
    store.try_claim(&id("t1"), &worker(0), t0()).await.unwrap().unwrap();

    assert!(!store.set_task_paused(&id("t1"), true, t0()).await.unwrap());
    assert!(!store.get(&id("t1")).await.unwrap().unwrap().paused);

    // resume is unconditional
    assert!(store.set_task_paused(&id("t1"), false, t0()).await.unwrap());
    assert!(!store.set_task_paused(&id("missing"), false, t0()).await.unwrap());
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn global_pause_flag_round_trips(#[case] backend: Backend) {
    let store = open(backend).await;
    store.ensure_control_state().await.unwrap();
    store.ensure_control_state().await.unwrap();
    assert!(!store.is_queue_paused().await.unwrap());

    store.set_queue_paused(true, t0()).await.unwrap();
    assert!(store.is_queue_paused().await.unwrap());
    store.ensure_control_state().await.unwrap();
    assert!(store.is_queue_paused().await.unwrap());

    store.set_queue_paused(false, t0()).await.unwrap();
    assert!(!store.is_queue_paused().await.unwrap());
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn counts_and_running_reflect_ledger(#[case] backend: Backend) {
    let store = open(backend).await;
    for name in ["a", "b", "c", "d"] {
        store.upsert(task(name, 3), t0()).await.unwrap();
    }
    store.try_claim(&id("a"), &worker(0), t0()).await.unwrap().unwrap();
    store.set_task_paused(&id("b"), true, t0()).await.unwrap();
    store.cancel(&id("c"), t0()).await.unwrap();
    store.set_queue_paused(true, t0()).await.unwrap();

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.running, 1);
    assert_eq!(counts.queued, 2);
    assert_eq!(counts.paused, 1);
    assert_eq!(counts.canceled, 1);
    assert!(counts.queue_paused);
    assert_eq!(counts.total(), 4);

    let running = store.running().await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].task_id, id("a"));
    assert_eq!(store.count_waiting().await.unwrap(), 1);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn exhausted_guard_is_checked_at_update_time(#[case] backend: Backend) {
    let store = open(backend).await;
    let retire = Settle::Fail {
        error: "max attempts exceeded".into(),
    };
    store.upsert(task("t1", 0), t0()).await.unwrap();
    let stale = store.next_queued(t0()).await.unwrap().unwrap();
    assert!(!stale.has_attempts_left());

    // re-submitted between the read and the retirement
    store.upsert(task("t1", 3), t0()).await.unwrap();
    assert!(!store.settle(&id("t1"), &Expect::Exhausted, &retire, t0()).await.unwrap());
    let r = store.get(&id("t1")).await.unwrap().unwrap();
    assert_eq!(r.status, TaskStatus::Queued);
    assert_eq!(r.max_attempts, 3);
    assert!(r.last_error.is_none());

    store.upsert(task("t2", 0), t0()).await.unwrap();
    assert!(store.settle(&id("t2"), &Expect::Exhausted, &retire, t0()).await.unwrap());
    assert_eq!(
        store.get(&id("t2")).await.unwrap().unwrap().status,
        TaskStatus::Failed
    );
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn unleased_guard_skips_a_leased_record(#[case] backend: Backend) {
    let store = open(backend).await;
    store.upsert(task("t1", 3), t0()).await.unwrap();
    store.try_claim(&id("t1"), &worker(0), t0()).await.unwrap().unwrap();

    let requeue = Settle::Requeue {
        error: None,
        available_at: t0(),
    };
    assert!(!store.settle(&id("t1"), &Expect::Unleased, &requeue, t0()).await.unwrap());
    assert!(!store.settle(&id("t1"), &Expect::HeldBy(worker(1)), &requeue, t0()).await.unwrap());
    assert_eq!(
        store.get(&id("t1")).await.unwrap().unwrap().status,
        TaskStatus::Running
    );
}
