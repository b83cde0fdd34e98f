//! Resilient client data layer.
//!
//! Caches API results with TTL expiry, invalidates them from domain events
//! through a rule graph, queues mutations with retry while offline, guards
//! every resource with a circuit breaker and applies optimistic updates
//! with rollback. [`DataLayer`] wires all of it together.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod metrics;
pub mod optimistic;
pub mod resilience;
pub mod scheduler;
pub mod sync;
pub mod transport;

use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use cache::{CacheResult, QueryLayer, TtlCache};
use clock::{Clock, SystemClock};
use config::Config;
use invalidation::InvalidationGraph;
use metrics::{MetricsSink, TracingSink};
use optimistic::OptimisticCoordinator;
use resilience::CircuitBreakerRegistry;
use scheduler::{Scheduler, TimerHandle, TokioScheduler};
use sync::{reconcile, NewTask, NoopTaskStore, QueueDeps, SqliteTaskStore, SyncQueue, TaskStore};
use transport::Transport;

pub use error::{Error, Result};

/// Time, timers and metrics shared by every component.
#[derive(Clone)]
pub struct Runtime {
  pub clock: Arc<dyn Clock>,
  pub scheduler: Arc<dyn Scheduler>,
  pub metrics: Arc<dyn MetricsSink>,
}

impl Default for Runtime {
  fn default() -> Self {
    Self {
      clock: Arc::new(SystemClock),
      scheduler: Arc::new(TokioScheduler),
      metrics: Arc::new(TracingSink),
    }
  }
}

/// Owns one instance of each component. Clone the `Arc`s it hands out
/// instead of reaching for globals.
pub struct DataLayer {
  config: Config,
  runtime: Runtime,
  cache: Arc<TtlCache<Value>>,
  graph: Arc<InvalidationGraph>,
  breakers: Arc<CircuitBreakerRegistry>,
  queue: SyncQueue,
  query: QueryLayer,
  optimistic: OptimisticCoordinator,
  sweeper: Mutex<Option<TimerHandle>>,
}

impl DataLayer {
  /// Production wiring: system clock, tokio timers, tracing metrics and the
  /// SQLite task store when persistence is enabled.
  pub fn new(config: Config, transport: Arc<dyn Transport>) -> color_eyre::Result<Self> {
    let store: Arc<dyn TaskStore> = if config.sync.persist {
      Arc::new(SqliteTaskStore::open(&config.sync_db_path()?)?)
    } else {
      Arc::new(NoopTaskStore)
    };
    Ok(Self::with_parts(config, transport, store, Runtime::default())?)
  }

  /// Wire the components from explicit parts. Fails only on malformed
  /// invalidation rules in the config.
  pub fn with_parts(
    config: Config,
    transport: Arc<dyn Transport>,
    store: Arc<dyn TaskStore>,
    runtime: Runtime,
  ) -> Result<Self> {
    let cache = Arc::new(TtlCache::new(
      config.cache.clone(),
      Arc::clone(&runtime.clock),
      Arc::clone(&runtime.metrics),
    ));

    let graph = Arc::new(InvalidationGraph::new(cache.clone()));
    graph.register_rules(config.invalidation.rules.iter().cloned())?;

    let breakers = Arc::new(CircuitBreakerRegistry::new(
      config.circuit_breaker.clone(),
      Arc::clone(&runtime.clock),
      Arc::clone(&runtime.metrics),
    ));

    let queue = SyncQueue::new(
      config.sync.clone(),
      QueueDeps {
        transport: Arc::clone(&transport),
        breakers: Arc::clone(&breakers),
        cache: Arc::clone(&cache),
        graph: Arc::clone(&graph),
        store,
        scheduler: Arc::clone(&runtime.scheduler),
        clock: Arc::clone(&runtime.clock),
        metrics: Arc::clone(&runtime.metrics),
      },
    );

    let query = QueryLayer::new(Arc::clone(&cache), Arc::clone(&breakers), transport);
    let optimistic = OptimisticCoordinator::new(Arc::clone(&cache));

    Ok(Self {
      config,
      runtime,
      cache,
      graph,
      breakers,
      queue,
      query,
      optimistic,
      sweeper: Mutex::new(None),
    })
  }

  /// Restore persisted tasks and start the sweeper and periodic sync.
  pub fn start(&self) {
    let restored = self.queue.restore();
    let handle = self.cache.start_sweeper(self.runtime.scheduler.as_ref());
    let previous = self
      .sweeper
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .replace(handle);
    if let Some(previous) = previous {
      previous.cancel();
    }
    self.queue.start();
    info!(restored, rules = self.graph.rules().len(), "Data layer started");
  }

  pub fn shutdown(&self) {
    if let Some(handle) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take() {
      handle.cancel();
    }
    self.queue.shutdown();
  }

  /// Cached read of `resource`.
  pub async fn get(&self, resource: &str) -> Result<CacheResult<Value>> {
    self.query.fetch(resource).await
  }

  /// Apply `update_fn` to the cached value under `key` right away, then
  /// submit `task` and wait for it. On success the confirmed mutation is
  /// folded into the value cached before the speculative write, and that
  /// becomes the result; on failure the cache is rolled back.
  pub async fn mutate_optimistic<F>(&self, key: &str, update_fn: F, task: NewTask) -> Result<Value>
  where
    F: FnOnce(&Value) -> Value + Send + 'static,
  {
    let queue = self.queue.clone();
    let now = self.runtime.clock.now();
    let confirmed = self
      .cache
      .entry(key)
      .filter(|e| !e.is_pinned() && !e.is_expired(now))
      .map(|e| e.value);

    let result = self
      .optimistic
      .operation(key, update_fn)
      .execute(move || async move {
        let kind = task.kind;
        let payload = task.payload.clone();
        let response = queue.submit(task).await?;
        Ok(
          match reconcile(confirmed.clone(), kind, payload.as_ref(), &response) {
            Some(next) => next,
            None => confirmed.unwrap_or(response),
          },
        )
      })
      .await;

    if let Err(e) = &result {
      warn!(key = %key, error = %e, "Optimistic mutation failed");
    }
    result
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn cache(&self) -> &Arc<TtlCache<Value>> {
    &self.cache
  }

  pub fn graph(&self) -> &Arc<InvalidationGraph> {
    &self.graph
  }

  pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
    &self.breakers
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  pub fn query(&self) -> &QueryLayer {
    &self.query
  }

  pub fn optimistic(&self) -> &OptimisticCoordinator {
    &self.optimistic
  }
}

impl Drop for DataLayer {
  fn drop(&mut self) {
    self.shutdown();
  }
}
