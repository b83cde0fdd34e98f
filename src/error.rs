//! Error taxonomy for the data layer.
//!
//! Transport failures are classified so the sync queue can decide whether a
//! retry makes sense. Cache misses and unmatched patterns are not errors.

use std::time::Duration;

/// Failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
  /// Connection refused, DNS failure, reset, etc.
  #[error("Network error: {0}")]
  Network(String),

  /// 5xx response
  #[error("Server fault {status}: {message}")]
  ServerFault { status: u16, message: String },

  /// 4xx response
  #[error("Client fault {status}: {message}")]
  ClientFault { status: u16, message: String },

  #[error("Request timed out")]
  Timeout,
}

impl TransportError {
  /// Client faults are surfaced immediately, everything else may be retried.
  pub fn is_retryable(&self) -> bool {
    !matches!(self, TransportError::ClientFault { .. })
  }
}

/// Crate-level error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
  #[error(transparent)]
  Transport(#[from] TransportError),

  /// Raised without attempting the call.
  #[error("Circuit breaker is open for {resource}")]
  CircuitOpen { resource: String },

  #[error("Call to {resource} timed out after {after:?}")]
  Timeout { resource: String, after: Duration },

  #[error("Task {task_id} failed after {attempts} attempts: {last_error}")]
  RetriesExhausted {
    task_id: String,
    attempts: u32,
    last_error: String,
  },

  #[error("Invalid invalidation rule '{rule}': {reason}")]
  InvalidRule { rule: String, reason: String },

  #[error("Optimistic update of '{key}' timed out and was rolled back")]
  OptimisticTimeout { key: String },

  /// A newer write or an explicit rollback took ownership of the key.
  #[error("Optimistic update of '{key}' was superseded")]
  Superseded { key: String },

  #[error("Sync queue dropped the task before it settled")]
  QueueClosed,
}

impl Error {
  /// Whether a sync task failing with this error may be attempted again.
  pub fn is_retryable(&self) -> bool {
    match self {
      Error::Transport(e) => e.is_retryable(),
      Error::CircuitOpen { .. } | Error::Timeout { .. } => true,
      _ => false,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_client_fault_is_not_retryable() {
    let err = Error::from(TransportError::ClientFault {
      status: 404,
      message: "not found".into(),
    });
    assert!(!err.is_retryable());
  }

  #[test]
  fn test_transient_errors_are_retryable() {
    assert!(Error::from(TransportError::Network("reset".into())).is_retryable());
    assert!(Error::from(TransportError::ServerFault {
      status: 503,
      message: "unavailable".into(),
    })
    .is_retryable());
    assert!(Error::CircuitOpen {
      resource: "keywords".into()
    }
    .is_retryable());
    assert!(!Error::QueueClosed.is_retryable());
  }
}
