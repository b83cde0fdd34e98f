//! Circuit breaker with three states: Closed (normal operation), Open
//! (failing fast) and HalfOpen (a single trial call tests recovery).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{CircuitBreakerConfig, CircuitBreakerMetrics};
use crate::clock::{elapsed, to_chrono, Clock};
use crate::error::Error;
use crate::metrics::{MetricEvent, MetricsSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
  /// All calls are allowed through
  Closed,
  /// All calls fail fast without executing
  Open,
  /// One trial call at a time tests whether the resource recovered
  HalfOpen,
}

impl fmt::Display for CircuitState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      CircuitState::Closed => "closed",
      CircuitState::Open => "open",
      CircuitState::HalfOpen => "half_open",
    })
  }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
  /// Rejected without executing the operation
  #[error("Circuit breaker is open for {resource}")]
  CircuitOpen { resource: String },

  #[error("Call to {resource} timed out after {after:?}")]
  Timeout { resource: String, after: Duration },

  #[error("Operation failed: {0}")]
  OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
  pub fn is_open(&self) -> bool {
    matches!(self, CircuitBreakerError::CircuitOpen { .. })
  }
}

impl<E: Into<Error>> From<CircuitBreakerError<E>> for Error {
  fn from(err: CircuitBreakerError<E>) -> Self {
    match err {
      CircuitBreakerError::CircuitOpen { resource } => Error::CircuitOpen { resource },
      CircuitBreakerError::Timeout { resource, after } => Error::Timeout { resource, after },
      CircuitBreakerError::OperationFailed(e) => e.into(),
    }
  }
}

struct BreakerState {
  state: CircuitState,
  consecutive_failures: u32,
  consecutive_timeouts: u32,
  half_open_successes: u32,
  /// Set while the single half-open trial call is running
  trial_in_flight: bool,
  opened_at: Option<DateTime<Utc>>,
  metrics: CircuitBreakerMetrics,
}

impl BreakerState {
  fn new() -> Self {
    Self {
      state: CircuitState::Closed,
      consecutive_failures: 0,
      consecutive_timeouts: 0,
      half_open_successes: 0,
      trial_in_flight: false,
      opened_at: None,
      metrics: CircuitBreakerMetrics::new(),
    }
  }
}

/// Fault-detection state machine guarding one named resource.
///
/// State is only touched synchronously around the wrapped future, so the
/// decision to admit the half-open trial is made before the trial runs.
pub struct CircuitBreaker {
  name: String,
  config: CircuitBreakerConfig,
  state: Mutex<BreakerState>,
  clock: Arc<dyn Clock>,
  sink: Arc<dyn MetricsSink>,
}

/// Clears the half-open trial slot if the call future is dropped early.
struct TrialGuard<'a> {
  breaker: &'a CircuitBreaker,
  armed: bool,
}

impl Drop for TrialGuard<'_> {
  fn drop(&mut self) {
    if self.armed {
      self.breaker.lock().trial_in_flight = false;
    }
  }
}

impl CircuitBreaker {
  pub fn new(
    name: impl Into<String>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
  ) -> Self {
    let name = name.into();
    info!(
      resource = %name,
      failure_threshold = config.failure_threshold,
      success_threshold = config.success_threshold,
      recovery_timeout_ms = config.recovery_timeout_ms,
      timeout_ms = config.timeout_ms,
      "Circuit breaker initialized"
    );

    Self {
      name,
      config,
      state: Mutex::new(BreakerState::new()),
      clock,
      sink,
    }
  }

  fn lock(&self) -> MutexGuard<'_, BreakerState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn config(&self) -> &CircuitBreakerConfig {
    &self.config
  }

  pub fn state(&self) -> CircuitState {
    self.lock().state
  }

  /// Time until an open circuit admits its trial call. `None` unless open.
  pub fn retry_after(&self) -> Option<Duration> {
    let now = self.clock.now();
    let s = self.lock();
    if s.state != CircuitState::Open {
      return None;
    }
    let remaining = s
      .opened_at
      .map(|at| elapsed(now, at + to_chrono(self.config.recovery_timeout())))
      .unwrap_or(Duration::ZERO);
    Some(remaining)
  }

  /// Execute `operation` under the breaker and its timeout.
  pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let trial = self.admit().map_err(|()| CircuitBreakerError::CircuitOpen {
      resource: self.name.clone(),
    })?;
    let mut guard = TrialGuard {
      breaker: self,
      armed: trial,
    };

    let timeout = self.config.timeout_duration();
    let start = Instant::now();
    let outcome = tokio::time::timeout(timeout, operation()).await;
    let duration = start.elapsed();
    guard.armed = false;

    match outcome {
      Ok(Ok(value)) => {
        self.record_success(duration);
        Ok(value)
      }
      Ok(Err(e)) => {
        self.record_failure(duration, false);
        Err(CircuitBreakerError::OperationFailed(e))
      }
      Err(_) => {
        self.record_failure(duration, true);
        Err(CircuitBreakerError::Timeout {
          resource: self.name.clone(),
          after: timeout,
        })
      }
    }
  }

  /// Like [`call`](Self::call), but any rejection or failure yields
  /// `fallback()` instead of an error.
  pub async fn call_with_fallback<F, Fut, T, E, G, GFut>(&self, operation: F, fallback: G) -> T
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    G: FnOnce() -> GFut,
    GFut: Future<Output = T>,
  {
    match self.call(operation).await {
      Ok(value) => value,
      Err(e) => {
        warn!(resource = %self.name, error = %e, "Using fallback");
        fallback().await
      }
    }
  }

  /// Decide whether a call may run. `Ok(true)` means it is the half-open
  /// trial.
  fn admit(&self) -> Result<bool, ()> {
    let now = self.clock.now();
    let mut s = self.lock();

    let current = s.state;
    match current {
      CircuitState::Closed => Ok(false),
      CircuitState::Open => {
        let recovered = s
          .opened_at
          .map(|at| now >= at + to_chrono(self.config.recovery_timeout()))
          .unwrap_or(true);
        if recovered {
          s.state = CircuitState::HalfOpen;
          s.half_open_successes = 0;
          s.trial_in_flight = true;
          info!(
            resource = %self.name,
            success_threshold = self.config.success_threshold,
            "Circuit breaker half-open (testing recovery)"
          );
          Ok(true)
        } else {
          s.metrics.rejected_requests += 1;
          debug!(resource = %self.name, "Circuit open, rejecting call");
          Err(())
        }
      }
      CircuitState::HalfOpen => {
        if s.trial_in_flight {
          s.metrics.rejected_requests += 1;
          debug!(resource = %self.name, "Trial call in flight, rejecting call");
          Err(())
        } else {
          s.trial_in_flight = true;
          Ok(true)
        }
      }
    }
  }

  fn record_success(&self, duration: Duration) {
    let now = self.clock.now();
    let reset = {
      let mut s = self.lock();
      s.metrics.total_requests += 1;
      s.metrics.successful_requests += 1;
      s.metrics.last_success_at = Some(now);
      s.metrics.record_duration(duration);
      s.consecutive_failures = 0;
      s.consecutive_timeouts = 0;

      let current = s.state;
      match current {
        CircuitState::HalfOpen => {
          s.trial_in_flight = false;
          s.half_open_successes += 1;
          if s.half_open_successes >= self.config.success_threshold.max(1) {
            s.state = CircuitState::Closed;
            s.opened_at = None;
            s.half_open_successes = 0;
            s.metrics.resets += 1;
            info!(
              resource = %self.name,
              total_requests = s.metrics.total_requests,
              "Circuit breaker closed (recovered)"
            );
            true
          } else {
            false
          }
        }
        CircuitState::Closed => false,
        CircuitState::Open => {
          // Forced open while the call was running
          warn!(resource = %self.name, "Success recorded while circuit is open");
          false
        }
      }
    };

    debug!(resource = %self.name, duration_ms = duration.as_millis() as u64, "Call succeeded");
    if reset {
      self.sink.record(MetricEvent::CircuitReset {
        resource: self.name.clone(),
      });
    }
  }

  fn record_failure(&self, duration: Duration, timed_out: bool) {
    let now = self.clock.now();
    let tripped = {
      let mut s = self.lock();
      s.metrics.total_requests += 1;
      s.metrics.failed_requests += 1;
      s.metrics.last_failure_at = Some(now);
      s.metrics.record_duration(duration);
      s.consecutive_failures += 1;
      if timed_out {
        s.metrics.timeout_requests += 1;
        s.consecutive_timeouts += 1;
      } else {
        s.consecutive_timeouts = 0;
      }

      let current = s.state;
      match current {
        CircuitState::HalfOpen => {
          // A single failure aborts recovery
          s.trial_in_flight = false;
          s.half_open_successes = 0;
          s.state = CircuitState::Open;
          s.opened_at = Some(now);
          warn!(resource = %self.name, "Trial call failed, circuit re-opened");
          false
        }
        CircuitState::Closed => {
          let threshold = self.effective_threshold(&s);
          if s.consecutive_failures >= threshold
            && s.metrics.total_requests >= self.config.min_requests_before_trip
          {
            s.state = CircuitState::Open;
            s.opened_at = Some(now);
            s.metrics.trips += 1;
            warn!(
              resource = %self.name,
              consecutive_failures = s.consecutive_failures,
              failure_threshold = threshold,
              recovery_timeout_ms = self.config.recovery_timeout_ms,
              "Circuit breaker opened (failing fast)"
            );
            true
          } else {
            false
          }
        }
        CircuitState::Open => false,
      }
    };

    debug!(
      resource = %self.name,
      duration_ms = duration.as_millis() as u64,
      timed_out,
      "Call failed"
    );
    if tripped {
      self.sink.record(MetricEvent::CircuitTrip {
        resource: self.name.clone(),
      });
    }
  }

  /// Failure threshold after adaptive lowering for consecutive timeouts.
  fn effective_threshold(&self, s: &BreakerState) -> u32 {
    let base = self.config.failure_threshold.max(1);
    if self.config.adaptive_thresholds {
      base.saturating_sub(s.consecutive_timeouts).max(1)
    } else {
      base
    }
  }

  /// Open the circuit immediately.
  pub fn force_open(&self) {
    let mut s = self.lock();
    s.state = CircuitState::Open;
    s.opened_at = Some(self.clock.now());
    s.trial_in_flight = false;
    s.half_open_successes = 0;
    warn!(resource = %self.name, "Circuit breaker forced open");
  }

  /// Return to a fresh closed circuit, clearing all counters.
  pub fn reset(&self) {
    *self.lock() = BreakerState::new();
    info!(resource = %self.name, "Circuit breaker reset");
  }

  pub fn metrics(&self) -> CircuitBreakerMetrics {
    let s = self.lock();
    let mut snapshot = s.metrics.clone();
    snapshot.state = s.state;
    snapshot.consecutive_failures = s.consecutive_failures;
    if snapshot.total_requests > 0 {
      snapshot.failure_rate = snapshot.failed_requests as f64 / snapshot.total_requests as f64;
    }
    snapshot.healthy =
      s.state != CircuitState::Open && snapshot.failure_rate < self.config.health_failure_rate;
    snapshot
  }

  pub fn is_healthy(&self) -> bool {
    self.metrics().healthy
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::metrics::RecordingSink;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, ManualClock, Arc<RecordingSink>) {
    let clock = ManualClock::default();
    let sink = Arc::new(RecordingSink::new());
    let cb = CircuitBreaker::new("test", config, Arc::new(clock.clone()), sink.clone());
    (cb, clock, sink)
  }

  fn config(failure_threshold: u32, success_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
      failure_threshold,
      success_threshold,
      recovery_timeout_ms: 1000,
      timeout_ms: 1000,
      min_requests_before_trip: 1,
      ..CircuitBreakerConfig::default()
    }
  }

  async fn fail(cb: &CircuitBreaker) {
    let _ = cb.call(|| async { Err::<(), _>("boom") }).await;
  }

  #[tokio::test]
  async fn test_normal_operation() {
    let (cb, _, _) = breaker(config(3, 2));
    assert_eq!(cb.state(), CircuitState::Closed);

    let result = cb.call(|| async { Ok::<_, String>("success") }).await;
    assert_eq!(result.unwrap(), "success");

    let metrics = cb.metrics();
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(metrics.successful_requests, 1);
    assert_eq!(metrics.failed_requests, 0);
    assert!(metrics.healthy);
  }

  #[tokio::test]
  async fn test_open_circuit_does_not_invoke_operation() {
    let (cb, _, sink) = breaker(config(2, 1));
    fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Closed);
    fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Open);

    let invoked = AtomicU32::new(0);
    let result = cb
      .call(|| async {
        invoked.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>(())
      })
      .await;

    assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(cb.metrics().rejected_requests, 1);
    assert_eq!(
      sink.events(),
      vec![MetricEvent::CircuitTrip {
        resource: "test".into()
      }]
    );
  }

  #[tokio::test]
  async fn test_min_requests_delays_trip() {
    let (cb, _, _) = breaker(CircuitBreakerConfig {
      min_requests_before_trip: 4,
      ..config(2, 1)
    });
    for _ in 0..3 {
      fail(&cb).await;
      assert_eq!(cb.state(), CircuitState::Closed);
    }
    fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Open);
  }

  #[tokio::test]
  async fn test_success_resets_consecutive_failures() {
    let (cb, _, _) = breaker(config(2, 1));
    fail(&cb).await;
    cb.call(|| async { Ok::<_, String>(()) }).await.unwrap();
    fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Closed);
  }

  #[tokio::test]
  async fn test_recovery_after_success_threshold() {
    let (cb, clock, sink) = breaker(config(1, 2));
    fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Open);

    clock.advance(Duration::from_millis(999));
    assert!(cb.call(|| async { Ok::<_, String>(()) }).await.is_err());

    clock.advance(Duration::from_millis(1));
    cb.call(|| async { Ok::<_, String>(()) }).await.unwrap();
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    cb.call(|| async { Ok::<_, String>(()) }).await.unwrap();
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.metrics().resets, 1);
    assert!(sink.events().contains(&MetricEvent::CircuitReset {
      resource: "test".into()
    }));
  }

  #[tokio::test]
  async fn test_half_open_failure_reopens() {
    let (cb, clock, _) = breaker(config(1, 3));
    fail(&cb).await;
    clock.advance(Duration::from_secs(2));

    fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Open);
    assert!(cb
      .call(|| async { Ok::<_, String>(()) })
      .await
      .unwrap_err()
      .is_open());
  }

  #[tokio::test]
  async fn test_half_open_admits_single_trial() {
    let (cb, clock, _) = breaker(config(1, 1));
    fail(&cb).await;
    clock.advance(Duration::from_secs(2));

    let (release, wait) = tokio::sync::oneshot::channel::<()>();
    let trial = cb.call(|| async move {
      let _ = wait.await;
      Ok::<_, String>("trial")
    });
    let second = async {
      tokio::task::yield_now().await;
      let rejected = cb.call(|| async { Ok::<_, String>("second") }).await;
      let _ = release.send(());
      rejected
    };

    let (trial, second) = tokio::join!(trial, second);
    assert_eq!(trial.unwrap(), "trial");
    assert!(second.unwrap_err().is_open());
    assert_eq!(cb.state(), CircuitState::Closed);
  }

  #[tokio::test]
  async fn test_timeout_counts_as_failure() {
    let (cb, _, _) = breaker(CircuitBreakerConfig {
      timeout_ms: 20,
      ..config(1, 1)
    });

    let result = cb
      .call(|| async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok::<_, String>(())
      })
      .await;

    assert!(matches!(result, Err(CircuitBreakerError::Timeout { .. })));
    assert_eq!(cb.state(), CircuitState::Open);
    assert_eq!(cb.metrics().timeout_requests, 1);
  }

  #[tokio::test]
  async fn test_adaptive_threshold_trips_faster_on_timeouts() {
    let (cb, _, _) = breaker(CircuitBreakerConfig {
      timeout_ms: 10,
      adaptive_thresholds: true,
      ..config(4, 1)
    });
    let slow = || async {
      tokio::time::sleep(Duration::from_millis(200)).await;
      Ok::<_, String>(())
    };

    let _ = cb.call(slow).await;
    assert_eq!(cb.state(), CircuitState::Closed);
    // Two consecutive timeouts lower the threshold from 4 to 2
    let _ = cb.call(slow).await;
    assert_eq!(cb.state(), CircuitState::Open);
  }

  #[tokio::test]
  async fn test_call_with_fallback() {
    let (cb, _, _) = breaker(config(1, 1));
    let value = cb
      .call_with_fallback(|| async { Err::<i32, _>("down") }, || async { -1 })
      .await;
    assert_eq!(value, -1);

    // Open now: fallback without invoking the operation
    let value = cb
      .call_with_fallback(|| async { Ok::<_, String>(1) }, || async { -2 })
      .await;
    assert_eq!(value, -2);
  }

  #[tokio::test]
  async fn test_force_open_and_reset() {
    let (cb, _, _) = breaker(config(5, 1));
    cb.force_open();
    assert_eq!(cb.state(), CircuitState::Open);
    assert!(!cb.is_healthy());

    cb.reset();
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.metrics().total_requests, 0);
    assert!(cb.call(|| async { Ok::<_, String>(()) }).await.is_ok());
  }

  #[tokio::test]
  async fn test_failure_rate_marks_unhealthy() {
    let (cb, _, _) = breaker(CircuitBreakerConfig {
      health_failure_rate: 0.5,
      ..config(10, 1)
    });
    cb.call(|| async { Ok::<_, String>(()) }).await.unwrap();
    fail(&cb).await;
    fail(&cb).await;

    let metrics = cb.metrics();
    assert_eq!(metrics.state, CircuitState::Closed);
    assert!((metrics.failure_rate - 2.0 / 3.0).abs() < 1e-9);
    assert!(!metrics.healthy);
  }

  #[tokio::test]
  async fn test_retry_after_counts_down_recovery() {
    let (cb, clock, _) = breaker(config(1, 1));
    assert_eq!(cb.retry_after(), None);

    fail(&cb).await;
    assert_eq!(cb.retry_after(), Some(Duration::from_millis(1000)));
    clock.advance(Duration::from_millis(400));
    assert_eq!(cb.retry_after(), Some(Duration::from_millis(600)));
    clock.advance(Duration::from_secs(1));
    assert_eq!(cb.retry_after(), Some(Duration::ZERO));

    cb.call(|| async { Ok::<_, String>(()) }).await.unwrap();
    assert_eq!(cb.retry_after(), None);
  }
}
