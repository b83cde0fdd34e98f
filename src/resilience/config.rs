use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Thresholds for a single circuit breaker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
  /// Consecutive failures that open a closed circuit
  pub failure_threshold: u32,
  /// Consecutive half-open successes that close the circuit again
  pub success_threshold: u32,
  /// How long an open circuit rejects calls before a trial is allowed
  pub recovery_timeout_ms: u64,
  /// Per-call timeout; exceeding it counts as a failure
  pub timeout_ms: u64,
  /// Calls that must have been made before the circuit may trip
  pub min_requests_before_trip: u64,
  /// Lower the failure threshold by one per consecutive timeout
  pub adaptive_thresholds: bool,
  /// Failure rate at or above which the breaker reports unhealthy
  pub health_failure_rate: f64,
}

impl Default for CircuitBreakerConfig {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      success_threshold: 2,
      recovery_timeout_ms: 30_000,
      timeout_ms: 10_000,
      min_requests_before_trip: 5,
      adaptive_thresholds: false,
      health_failure_rate: 0.5,
    }
  }
}

impl CircuitBreakerConfig {
  pub fn recovery_timeout(&self) -> Duration {
    Duration::from_millis(self.recovery_timeout_ms)
  }

  pub fn timeout_duration(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

/// Per-resource overrides; unset fields fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BreakerOverrides {
  pub failure_threshold: Option<u32>,
  pub success_threshold: Option<u32>,
  pub recovery_timeout_ms: Option<u64>,
  pub timeout_ms: Option<u64>,
  pub min_requests_before_trip: Option<u64>,
  pub adaptive_thresholds: Option<bool>,
  pub health_failure_rate: Option<f64>,
}

/// `circuit_breaker` section of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CircuitBreakerSettings {
  #[serde(default)]
  pub defaults: CircuitBreakerConfig,
  #[serde(default)]
  pub resources: HashMap<String, BreakerOverrides>,
}

impl CircuitBreakerSettings {
  /// Effective configuration for `resource`.
  pub fn for_resource(&self, resource: &str) -> CircuitBreakerConfig {
    let base = self.defaults.clone();
    let Some(o) = self.resources.get(resource) else {
      return base;
    };

    CircuitBreakerConfig {
      failure_threshold: o.failure_threshold.unwrap_or(base.failure_threshold),
      success_threshold: o.success_threshold.unwrap_or(base.success_threshold),
      recovery_timeout_ms: o.recovery_timeout_ms.unwrap_or(base.recovery_timeout_ms),
      timeout_ms: o.timeout_ms.unwrap_or(base.timeout_ms),
      min_requests_before_trip: o
        .min_requests_before_trip
        .unwrap_or(base.min_requests_before_trip),
      adaptive_thresholds: o.adaptive_thresholds.unwrap_or(base.adaptive_thresholds),
      health_failure_rate: o.health_failure_rate.unwrap_or(base.health_failure_rate),
    }
  }
}
