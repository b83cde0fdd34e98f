//! Task store trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use super::task::{FailedTask, SyncTask};

/// Persistence for pending and failed sync tasks.
pub trait TaskStore: Send + Sync {
  /// Insert or replace a pending task.
  fn save_task(&self, task: &SyncTask) -> Result<()>;

  fn remove_task(&self, id: &str) -> Result<()>;

  /// Pending tasks, oldest first.
  fn load_pending(&self) -> Result<Vec<SyncTask>>;

  /// Move a task from pending to the failure log.
  fn record_failure(&self, failed: &FailedTask) -> Result<()>;

  fn load_failures(&self) -> Result<Vec<FailedTask>>;

  fn clear_failures(&self) -> Result<()>;
}

/// Store that keeps nothing. Used when persistence is disabled.
pub struct NoopTaskStore;

impl TaskStore for NoopTaskStore {
  fn save_task(&self, _task: &SyncTask) -> Result<()> {
    Ok(())
  }

  fn remove_task(&self, _id: &str) -> Result<()> {
    Ok(())
  }

  fn load_pending(&self) -> Result<Vec<SyncTask>> {
    Ok(Vec::new())
  }

  fn record_failure(&self, _failed: &FailedTask) -> Result<()> {
    Ok(())
  }

  fn load_failures(&self) -> Result<Vec<FailedTask>> {
    Ok(Vec::new())
  }

  fn clear_failures(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based task store. Tasks are stored as JSON.
pub struct SqliteTaskStore {
  conn: Mutex<Connection>,
}

/// Schema for task tables.
const TASK_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_tasks (
    id TEXT PRIMARY KEY,
    target_resource TEXT NOT NULL,
    priority TEXT NOT NULL,
    created_at TEXT NOT NULL,
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_tasks_created
    ON pending_tasks(created_at);

CREATE TABLE IF NOT EXISTS failed_tasks (
    id TEXT PRIMARY KEY,
    target_resource TEXT NOT NULL,
    error TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    data TEXT NOT NULL
);
"#;

impl SqliteTaskStore {
  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create sync store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open sync store at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(TASK_SCHEMA)
      .map_err(|e| eyre!("Failed to run sync store migrations: {}", e))?;

    Ok(())
  }
}

impl TaskStore for SqliteTaskStore {
  fn save_task(&self, task: &SyncTask) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let data = serde_json::to_string(task).map_err(|e| eyre!("Failed to serialize task: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO pending_tasks (id, target_resource, priority, created_at, data)
         VALUES (?, ?, ?, ?, ?)",
        params![
          task.id,
          task.target_resource,
          task.priority.to_string(),
          task.created_at.to_rfc3339(),
          data
        ],
      )
      .map_err(|e| eyre!("Failed to save task {}: {}", task.id, e))?;

    Ok(())
  }

  fn remove_task(&self, id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM pending_tasks WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove task {}: {}", id, e))?;

    Ok(())
  }

  fn load_pending(&self) -> Result<Vec<SyncTask>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT id, data FROM pending_tasks ORDER BY created_at")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
      .map_err(|e| eyre!("Failed to query pending tasks: {}", e))?;

    Ok(decode_rows("pending_tasks", rows))
  }

  fn record_failure(&self, failed: &FailedTask) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let data =
      serde_json::to_string(failed).map_err(|e| eyre!("Failed to serialize failure: {}", e))?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let result = conn
      .execute(
        "DELETE FROM pending_tasks WHERE id = ?",
        params![failed.task.id],
      )
      .and_then(|_| {
        conn.execute(
          "INSERT OR REPLACE INTO failed_tasks (id, target_resource, error, failed_at, data)
           VALUES (?, ?, ?, ?, ?)",
          params![
            failed.task.id,
            failed.task.target_resource,
            failed.error,
            failed.failed_at.to_rfc3339(),
            data
          ],
        )
      });

    if let Err(e) = result {
      let _ = conn.execute("ROLLBACK", []);
      return Err(eyre!("Failed to record failure of {}: {}", failed.task.id, e));
    }

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn load_failures(&self) -> Result<Vec<FailedTask>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT id, data FROM failed_tasks ORDER BY failed_at")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
      .map_err(|e| eyre!("Failed to query failed tasks: {}", e))?;

    Ok(decode_rows("failed_tasks", rows))
  }

  fn clear_failures(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM failed_tasks", [])
      .map_err(|e| eyre!("Failed to clear failed tasks: {}", e))?;

    Ok(())
  }
}

/// Deserialize `(id, data)` rows. Unreadable rows are logged and skipped so
/// one bad row does not hide the rest.
fn decode_rows<T: DeserializeOwned>(
  table: &str,
  rows: impl Iterator<Item = rusqlite::Result<(String, String)>>,
) -> Vec<T> {
  rows
    .filter_map(|row| match row {
      Ok((id, data)) => match serde_json::from_str(&data) {
        Ok(value) => Some(value),
        Err(e) => {
          warn!(table = %table, id = %id, error = %e, "Skipping unreadable stored task");
          None
        }
      },
      Err(e) => {
        warn!(table = %table, error = %e, "Skipping unreadable row");
        None
      }
    })
    .collect()
}
