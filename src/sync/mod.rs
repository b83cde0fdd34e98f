//! Offline-first mutation queue.
//!
//! Mutations are queued as [`SyncTask`]s, dispatched in priority order through
//! the circuit breaker of their resource, retried with linear backoff and
//! finally moved to a failure log. With persistence enabled, pending and
//! failed tasks survive restarts in SQLite.

mod queue;
mod reconcile;
mod store;
mod task;

pub use queue::{QueueDeps, SyncQueue, SyncStats};
pub use reconcile::reconcile;
pub use store::{NoopTaskStore, SqliteTaskStore, TaskStore};
pub use task::{FailedTask, NewTask, Priority, SyncTask, TaskKind};
