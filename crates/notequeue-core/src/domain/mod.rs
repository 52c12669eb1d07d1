//! Domain model (IDs, status, records, payloads, outcomes, errors).
//!
//! ここはキュー実装（SQLite / in-memory）にもワーカーにも依存しない。

pub mod errors;
pub mod ids;
pub mod outcome;
pub mod payload;
pub mod record;
pub mod state;

pub use errors::{QueueError, Result};
pub use ids::{TaskId, WorkerId};
pub use outcome::{Outcome, OutcomeKind};
pub use payload::{NoteRequest, TaskPayload};
pub use record::{Expect, Lease, NewTask, Settle, TaskRecord};
pub use state::TaskStatus;
