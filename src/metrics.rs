//! Observability events emitted by the data layer.

use std::sync::Mutex;
use tracing::{info, warn};

/// Event recorded by a [`MetricsSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricEvent {
  /// A breaker moved to open from closed.
  CircuitTrip { resource: String },
  /// A breaker closed again after successful half-open trials.
  CircuitReset { resource: String },
  TaskCompleted { resource: String, attempts: u32 },
  /// A sync task was moved to the failure log.
  TaskFailed { task_id: String, resource: String, attempts: u32 },
  CacheEviction { key: String },
}

pub trait MetricsSink: Send + Sync {
  fn record(&self, event: MetricEvent);
}

/// Sink that writes every event to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
  fn record(&self, event: MetricEvent) {
    match event {
      MetricEvent::CircuitTrip { resource } => {
        warn!(resource = %resource, metric = "circuit_trip", "Circuit tripped")
      }
      MetricEvent::CircuitReset { resource } => {
        info!(resource = %resource, metric = "circuit_reset", "Circuit reset")
      }
      MetricEvent::TaskCompleted { resource, attempts } => {
        info!(resource = %resource, attempts, metric = "task_completed", "Sync task completed")
      }
      MetricEvent::TaskFailed {
        task_id,
        resource,
        attempts,
      } => {
        warn!(task_id = %task_id, resource = %resource, attempts, metric = "task_failed", "Sync task failed")
      }
      MetricEvent::CacheEviction { key } => {
        tracing::debug!(key = %key, metric = "cache_eviction", "Cache entry evicted")
      }
    }
  }
}

/// Sink that keeps events in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
  events: Mutex<Vec<MetricEvent>>,
}

impl RecordingSink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<MetricEvent> {
    self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  pub fn count(&self, pred: impl Fn(&MetricEvent) -> bool) -> usize {
    self
      .events
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .filter(|e| pred(e))
      .count()
  }
}

impl MetricsSink for RecordingSink {
  fn record(&self, event: MetricEvent) {
    self
      .events
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(event);
  }
}
