use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use super::circuit_breaker::CircuitState;

/// Counters kept by a circuit breaker, plus derived health figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
  pub state: CircuitState,
  /// Calls admitted and executed
  pub total_requests: u64,
  pub successful_requests: u64,
  /// Failures, timeouts included
  pub failed_requests: u64,
  pub timeout_requests: u64,
  /// Calls refused without being executed
  pub rejected_requests: u64,
  pub trips: u64,
  pub resets: u64,
  pub consecutive_failures: u32,
  pub last_failure_at: Option<DateTime<Utc>>,
  pub last_success_at: Option<DateTime<Utc>>,
  pub avg_response_time: Duration,
  pub failure_rate: f64,
  pub healthy: bool,
}

impl CircuitBreakerMetrics {
  pub(crate) fn new() -> Self {
    Self {
      state: CircuitState::Closed,
      total_requests: 0,
      successful_requests: 0,
      failed_requests: 0,
      timeout_requests: 0,
      rejected_requests: 0,
      trips: 0,
      resets: 0,
      consecutive_failures: 0,
      last_failure_at: None,
      last_success_at: None,
      avg_response_time: Duration::ZERO,
      failure_rate: 0.0,
      healthy: true,
    }
  }

  /// Fold one response time into the running average.
  pub(crate) fn record_duration(&mut self, duration: Duration) {
    let n = self.total_requests.max(1) as u128;
    let avg = self.avg_response_time.as_nanos();
    let next = (avg * (n - 1) + duration.as_nanos()) / n;
    self.avg_response_time = Duration::from_nanos(next.min(u64::MAX as u128) as u64);
  }
}
