use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::invalidation::Action;
use crate::transport::{Method, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
  Create,
  Update,
  Delete,
  /// Full refresh of the resource from the server
  Sync,
}

impl TaskKind {
  pub fn action(&self) -> Action {
    match self {
      TaskKind::Create => Action::Create,
      TaskKind::Update => Action::Update,
      TaskKind::Delete => Action::Delete,
      TaskKind::Sync => Action::Refresh,
    }
  }

  pub fn method(&self) -> Method {
    match self {
      TaskKind::Create => Method::Post,
      TaskKind::Update => Method::Put,
      TaskKind::Delete => Method::Delete,
      TaskKind::Sync => Method::Get,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      TaskKind::Create => "create",
      TaskKind::Update => "update",
      TaskKind::Delete => "delete",
      TaskKind::Sync => "sync",
    }
  }
}

impl fmt::Display for TaskKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for TaskKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "create" => Ok(TaskKind::Create),
      "update" => Ok(TaskKind::Update),
      "delete" => Ok(TaskKind::Delete),
      "sync" => Ok(TaskKind::Sync),
      other => Err(format!("unknown task kind '{}'", other)),
    }
  }
}

/// Dispatch priority. Ordering is ascending: `Critical` is the greatest.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  #[default]
  Medium,
  High,
  Critical,
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(match self {
      Priority::Low => "low",
      Priority::Medium => "medium",
      Priority::High => "high",
      Priority::Critical => "critical",
    })
  }
}

impl FromStr for Priority {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "low" => Ok(Priority::Low),
      "medium" => Ok(Priority::Medium),
      "high" => Ok(Priority::High),
      "critical" => Ok(Priority::Critical),
      other => Err(format!("unknown priority '{}'", other)),
    }
  }
}

/// A mutation to enqueue; the queue fills in id, attempts and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
  pub kind: TaskKind,
  pub target_resource: String,
  pub payload: Option<Value>,
  pub priority: Priority,
  /// Falls back to the queue's configured maximum
  pub max_attempts: Option<u32>,
}

impl NewTask {
  pub fn new(kind: TaskKind, target_resource: impl Into<String>) -> Self {
    Self {
      kind,
      target_resource: target_resource.into(),
      payload: None,
      priority: Priority::default(),
      max_attempts: None,
    }
  }

  pub fn with_payload(mut self, payload: Value) -> Self {
    self.payload = Some(payload);
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = Some(max_attempts);
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
  pub id: String,
  pub kind: TaskKind,
  pub target_resource: String,
  pub payload: Option<Value>,
  pub priority: Priority,
  pub attempt: u32,
  pub max_attempts: u32,
  pub created_at: DateTime<Utc>,
  pub last_attempt_at: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
  /// Backoff gate: the task is not dispatched before this time
  pub next_attempt_at: Option<DateTime<Utc>>,
}

impl SyncTask {
  pub fn from_new(new: NewTask, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      kind: new.kind,
      target_resource: new.target_resource,
      payload: new.payload,
      priority: new.priority,
      attempt: 0,
      max_attempts: new.max_attempts.unwrap_or(default_max_attempts).max(1),
      created_at: now,
      last_attempt_at: None,
      last_error: None,
      next_attempt_at: None,
    }
  }

  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| now >= at)
  }

  /// `id` field of the payload, as a string.
  pub fn entity_id(&self) -> Option<String> {
    match self.payload.as_ref()?.get("id")? {
      Value::String(s) => Some(s.clone()),
      Value::Number(n) => Some(n.to_string()),
      _ => None,
    }
  }

  /// Stable across retries of this task.
  pub fn idempotency_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.id.as_bytes());
    hasher.update(self.kind.as_str().as_bytes());
    hasher.update(self.target_resource.as_bytes());
    if let Some(payload) = &self.payload {
      hasher.update(payload.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
  }

  /// HTTP request for this task. Updates and deletes address the entity
  /// by its payload id when there is one.
  pub fn request(&self) -> Request {
    let resource = match (self.kind, self.entity_id()) {
      (TaskKind::Update | TaskKind::Delete, Some(id)) => {
        format!("{}/{}", self.target_resource.trim_end_matches('/'), id)
      }
      _ => self.target_resource.clone(),
    };

    Request {
      method: self.kind.method(),
      resource,
      payload: match self.kind {
        TaskKind::Sync | TaskKind::Delete => None,
        TaskKind::Create | TaskKind::Update => self.payload.clone(),
      },
      idempotency_key: Some(self.idempotency_key()),
    }
  }
}

/// A task that will not be retried, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
  pub task: SyncTask,
  pub error: String,
  pub failed_at: DateTime<Utc>,
}
