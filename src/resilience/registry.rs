use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

use super::{CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerSettings};
use crate::clock::Clock;
use crate::metrics::MetricsSink;

/// One circuit breaker per resource, created on first use.
pub struct CircuitBreakerRegistry {
  settings: CircuitBreakerSettings,
  clock: Arc<dyn Clock>,
  sink: Arc<dyn MetricsSink>,
  breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
  pub fn new(
    settings: CircuitBreakerSettings,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
  ) -> Self {
    Self {
      settings,
      clock,
      sink,
      breakers: Mutex::new(HashMap::new()),
    }
  }

  /// Breaker for `resource`, configured from its overrides if any.
  pub fn get(&self, resource: &str) -> Arc<CircuitBreaker> {
    let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
    let breaker = breakers.entry(resource.to_string()).or_insert_with(|| {
      Arc::new(CircuitBreaker::new(
        resource,
        self.settings.for_resource(resource),
        Arc::clone(&self.clock),
        Arc::clone(&self.sink),
      ))
    });
    Arc::clone(breaker)
  }

  /// Metrics for every breaker created so far, sorted by resource.
  pub fn all_metrics(&self) -> Vec<(String, CircuitBreakerMetrics)> {
    let breakers: Vec<Arc<CircuitBreaker>> = self
      .breakers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .values()
      .cloned()
      .collect();

    let mut metrics: Vec<(String, CircuitBreakerMetrics)> = breakers
      .iter()
      .map(|b| (b.name().to_string(), b.metrics()))
      .collect();
    metrics.sort_by(|a, b| a.0.cmp(&b.0));
    metrics
  }

  pub fn reset_all(&self) {
    let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
    for breaker in breakers.values() {
      breaker.reset();
    }
    info!(count = breakers.len(), "Reset all circuit breakers");
  }
}
