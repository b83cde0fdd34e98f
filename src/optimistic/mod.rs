//! Optimistic updates: write the expected result into the cache right
//! away, then confirm or roll back once the server answers.
//!
//! Every operation takes a fresh generation for its cache key. Only the
//! operation holding the current generation may write the authoritative
//! result or restore the snapshot; anything that settles later is
//! discarded and reported as [`Error::Superseded`].

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, TtlCache};
use crate::error::{Error, Result};

type UpdateFn = Box<dyn FnOnce(&Value) -> Value + Send>;
type RollbackFn = Box<dyn FnOnce(Value) -> Value + Send>;
type SuccessFn = Box<dyn FnOnce(&Value) + Send>;
type ErrorFn = Box<dyn FnOnce(&Error, Option<&Value>) + Send>;

struct KeyState {
  generation: u64,
  /// Last confirmed entry; what a rollback restores
  base: Option<CacheEntry<Value>>,
  active: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tracks in-flight optimistic operations per cache key.
pub struct OptimisticCoordinator {
  cache: Arc<TtlCache<Value>>,
  keys: Mutex<HashMap<String, KeyState>>,
  next_generation: AtomicU64,
}

impl OptimisticCoordinator {
  pub fn new(cache: Arc<TtlCache<Value>>) -> Self {
    Self {
      cache,
      keys: Mutex::new(HashMap::new()),
      next_generation: AtomicU64::new(0),
    }
  }

  /// Start building an operation on `key`. `update_fn` maps the cached
  /// value to the speculative one.
  pub fn operation<F>(&self, key: impl Into<String>, update_fn: F) -> OptimisticOperation<'_>
  where
    F: FnOnce(&Value) -> Value + Send + 'static,
  {
    OptimisticOperation {
      coordinator: self,
      key: key.into(),
      update_fn: Mutex::new(Some(Box::new(update_fn))),
      rollback_fn: Mutex::new(None),
      on_success: Mutex::new(None),
      on_error: Mutex::new(None),
      timeout: None,
      state: Mutex::new(OpState::Idle),
    }
  }

  /// Keys with an operation in flight.
  pub fn active_keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = lock(&self.keys).keys().cloned().collect();
    keys.sort();
    keys
  }

  /// Claim a new generation for `key`. Returns it with the confirmed
  /// snapshot to roll back to.
  fn begin(&self, key: &str) -> (u64, Option<CacheEntry<Value>>) {
    let generation = self.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
    let mut keys = lock(&self.keys);
    let state = keys.entry(key.to_string()).or_insert_with(|| KeyState {
      generation,
      base: self.cache.entry(key),
      active: 0,
    });
    state.generation = generation;
    state.active += 1;
    (generation, state.base.clone())
  }

  /// Settle one operation. Returns false when a newer operation owns the
  /// key, in which case the cache is left alone.
  fn finish(
    &self,
    key: &str,
    generation: u64,
    outcome: std::result::Result<&Value, Option<RollbackFn>>,
  ) -> bool {
    let mut keys = lock(&self.keys);
    let Some(state) = keys.get_mut(key) else {
      return false;
    };
    let current = state.generation == generation;

    if current {
      match outcome {
        Ok(value) => {
          self.cache.set(key, value.clone(), None);
          state.base = self.cache.entry(key);
        }
        Err(rollback_fn) => match state.base.clone() {
          Some(mut entry) => {
            if let Some(f) = rollback_fn {
              entry.value = f(entry.value);
            }
            self.cache.restore(entry);
          }
          None => {
            self.cache.delete(key);
          }
        },
      }
    }

    state.active = state.active.saturating_sub(1);
    if state.active == 0 {
      keys.remove(key);
    }
    current
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
  Idle,
  Active { generation: u64 },
  Concluded,
}

/// One speculative write and its confirmation or rollback.
pub struct OptimisticOperation<'a> {
  coordinator: &'a OptimisticCoordinator,
  key: String,
  update_fn: Mutex<Option<UpdateFn>>,
  rollback_fn: Mutex<Option<RollbackFn>>,
  on_success: Mutex<Option<SuccessFn>>,
  on_error: Mutex<Option<ErrorFn>>,
  timeout: Option<Duration>,
  state: Mutex<OpState>,
}

impl<'a> OptimisticOperation<'a> {
  /// Applied to the restored value on rollback, e.g. to strip pending
  /// markers.
  pub fn rollback_fn<F>(self, f: F) -> Self
  where
    F: FnOnce(Value) -> Value + Send + 'static,
  {
    *lock(&self.rollback_fn) = Some(Box::new(f));
    self
  }

  pub fn on_success<F>(self, f: F) -> Self
  where
    F: FnOnce(&Value) + Send + 'static,
  {
    *lock(&self.on_success) = Some(Box::new(f));
    self
  }

  /// Called with the error and the snapshot value after a rollback.
  pub fn on_error<F>(self, f: F) -> Self
  where
    F: FnOnce(&Error, Option<&Value>) + Send + 'static,
  {
    *lock(&self.on_error) = Some(Box::new(f));
    self
  }

  /// Roll back if `api_call` has not settled within `timeout`. The call
  /// itself keeps running; its result is dropped.
  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  /// Apply the speculative write, run `api_call` and settle.
  pub async fn execute<F, Fut>(&self, api_call: F) -> Result<Value>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let coordinator = self.coordinator;
    let cache = &coordinator.cache;

    let (generation, snapshot) = {
      let mut state = lock(&self.state);
      if *state != OpState::Idle {
        return Err(Error::Superseded {
          key: self.key.clone(),
        });
      }
      let (generation, snapshot) = coordinator.begin(&self.key);
      *state = OpState::Active { generation };
      (generation, snapshot)
    };

    // Compose on whatever is live now, which may be another pending write.
    // An expired entry counts as absent.
    if let Some(current) = cache.peek(&self.key) {
      if let Some(update) = lock(&self.update_fn).take() {
        cache.set_pinned(self.key.clone(), update(&current));
        debug!(key = %self.key, generation, "Applied speculative write");
      }
    }

    let abandoned = Arc::new(AtomicBool::new(false));
    let call = {
      let abandoned = Arc::clone(&abandoned);
      let key = self.key.clone();
      let fut = api_call();
      tokio::spawn(async move {
        let result = fut.await;
        if abandoned.load(Ordering::Acquire) {
          debug!(key = %key, generation, "Discarding late optimistic result");
        }
        result
      })
    };

    let joined = match self.timeout {
      Some(limit) => match tokio::time::timeout(limit, call).await {
        Ok(joined) => Some(joined),
        Err(_) => None,
      },
      None => Some(call.await),
    };

    let result = match joined {
      Some(Ok(result)) => result,
      Some(Err(join_err)) => {
        let panicked = join_err.is_panic();
        self.settle_failure(generation);
        if panicked {
          std::panic::resume_unwind(join_err.into_panic());
        }
        return Err(Error::Superseded {
          key: self.key.clone(),
        });
      }
      None => {
        abandoned.store(true, Ordering::Release);
        warn!(key = %self.key, timeout = ?self.timeout, "Optimistic update timed out");
        Err(Error::OptimisticTimeout {
          key: self.key.clone(),
        })
      }
    };

    match result {
      Ok(value) => {
        if !self.conclude(generation) {
          return Err(self.superseded());
        }
        if !coordinator.finish(&self.key, generation, Ok(&value)) {
          return Err(self.superseded());
        }
        if let Some(f) = lock(&self.on_success).take() {
          f(&value);
        }
        debug!(key = %self.key, generation, "Optimistic update confirmed");
        Ok(value)
      }
      Err(err) => {
        if !self.settle_failure(generation) {
          return Err(self.superseded());
        }
        info!(key = %self.key, error = %err, "Rolled back optimistic update");
        if let Some(f) = lock(&self.on_error).take() {
          f(&err, snapshot.as_ref().map(|e| &e.value));
        }
        Err(err)
      }
    }
  }

  /// Restore the snapshot now. Safe to call any number of times, before,
  /// during or after `execute`; does nothing once the operation settled.
  pub fn rollback(&self) {
    let generation = match *lock(&self.state) {
      OpState::Active { generation } => generation,
      _ => return,
    };
    if self.settle_failure(generation) {
      info!(key = %self.key, "Optimistic update cancelled");
    }
  }

  /// Mark the operation settled. False if it already was.
  fn conclude(&self, generation: u64) -> bool {
    let mut state = lock(&self.state);
    if *state != (OpState::Active { generation }) {
      return false;
    }
    *state = OpState::Concluded;
    true
  }

  fn settle_failure(&self, generation: u64) -> bool {
    if !self.conclude(generation) {
      return false;
    }
    let rollback_fn = lock(&self.rollback_fn).take();
    self
      .coordinator
      .finish(&self.key, generation, Err(rollback_fn))
  }

  fn superseded(&self) -> Error {
    debug!(key = %self.key, "Optimistic result superseded");
    Error::Superseded {
      key: self.key.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::config::CacheConfig;
  use crate::error::TransportError;
  use crate::metrics::RecordingSink;
  use serde_json::json;
  use tokio::sync::oneshot;

  fn setup() -> (Arc<TtlCache<Value>>, OptimisticCoordinator) {
    let cache = Arc::new(TtlCache::new(
      CacheConfig::default(),
      Arc::new(ManualClock::default()),
      Arc::new(RecordingSink::new()),
    ));
    let coordinator = OptimisticCoordinator::new(cache.clone());
    (cache, coordinator)
  }

  fn add_term(term: &'static str) -> impl FnOnce(&Value) -> Value + Send + 'static {
    move |list: &Value| {
      let mut items = list.as_array().cloned().unwrap_or_default();
      items.push(json!({ "term": term, "pending": true }));
      Value::Array(items)
    }
  }

  fn server_fault() -> Error {
    Error::Transport(TransportError::ServerFault {
      status: 500,
      message: "boom".into(),
    })
  }

  #[tokio::test]
  async fn test_failure_restores_exact_snapshot() {
    let (cache, coordinator) = setup();
    cache.set("keywords", json!([{"term": "rust"}]), None);
    let before = cache.entry("keywords").unwrap();

    let seen = Arc::new(Mutex::new(None));
    let seen_in_cb = Arc::clone(&seen);
    let op = coordinator
      .operation("keywords", add_term("tokio"))
      .on_error(move |err, snapshot| {
        *seen_in_cb.lock().unwrap() = Some((err.to_string(), snapshot.cloned()));
      });

    let err = op
      .execute(|| async { Err::<Value, _>(server_fault()) })
      .await
      .unwrap_err();

    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(cache.entry("keywords").unwrap(), before);
    let (message, snapshot) = seen.lock().unwrap().clone().unwrap();
    assert!(message.contains("500"));
    assert_eq!(snapshot, Some(json!([{"term": "rust"}])));
    assert!(coordinator.active_keys().is_empty());
  }

  #[tokio::test]
  async fn test_speculative_value_is_pinned_until_confirmed() {
    let (cache, coordinator) = setup();
    cache.set("keywords", json!([]), None);
    let (tx, rx) = oneshot::channel::<Value>();

    let op = coordinator.operation("keywords", add_term("tokio"));
    let call = op.execute(|| async move { rx.await.map_err(|_| Error::QueueClosed) });
    let check = async {
      let entry = cache.entry("keywords").unwrap();
      assert!(entry.is_pinned());
      assert_eq!(entry.value, json!([{"term": "tokio", "pending": true}]));
      tx.send(json!([{"id": 1, "term": "tokio"}])).unwrap();
    };
    let (result, _) = tokio::join!(call, check);

    assert_eq!(result.unwrap(), json!([{"id": 1, "term": "tokio"}]));
    let entry = cache.entry("keywords").unwrap();
    assert!(!entry.is_pinned());
    assert_eq!(entry.value, json!([{"id": 1, "term": "tokio"}]));
  }

  #[tokio::test]
  async fn test_rollback_after_success_is_noop() {
    let (cache, coordinator) = setup();
    cache.set("keywords", json!([]), None);
    let confirmed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&confirmed);

    let op = coordinator
      .operation("keywords", add_term("serde"))
      .on_success(move |_| flag.store(true, Ordering::SeqCst));
    op.execute(|| async { Ok(json!(["authoritative"])) })
      .await
      .unwrap();

    op.rollback();
    op.rollback();
    assert!(confirmed.load(Ordering::SeqCst));
    assert_eq!(cache.get("keywords"), Some(json!(["authoritative"])));
  }

  #[tokio::test]
  async fn test_timeout_rolls_back() {
    let (cache, coordinator) = setup();
    cache.set("keywords", json!(["before"]), None);
    let before = cache.entry("keywords").unwrap();

    let op = coordinator
      .operation("keywords", add_term("slow"))
      .timeout(Duration::from_millis(20));
    let err = op
      .execute(|| futures::future::pending::<Result<Value>>())
      .await
      .unwrap_err();

    assert!(matches!(err, Error::OptimisticTimeout { .. }));
    assert_eq!(cache.entry("keywords").unwrap(), before);
  }

  #[tokio::test]
  async fn test_rollback_during_flight_discards_late_result() {
    let (cache, coordinator) = setup();
    cache.set("keywords", json!(["before"]), None);
    let before = cache.entry("keywords").unwrap();
    let (tx, rx) = oneshot::channel::<Value>();

    let op = coordinator.operation("keywords", add_term("cancelled"));
    let call = op.execute(|| async move { rx.await.map_err(|_| Error::QueueClosed) });
    let cancel = async {
      op.rollback();
      op.rollback();
      tx.send(json!(["late"])).unwrap();
    };
    let (result, _) = tokio::join!(call, cancel);

    assert!(matches!(result.unwrap_err(), Error::Superseded { .. }));
    assert_eq!(cache.entry("keywords").unwrap(), before);
  }

  #[tokio::test]
  async fn test_newer_operation_supersedes_older() {
    let (cache, coordinator) = setup();
    cache.set("keywords", json!([]), None);
    let (tx, rx) = oneshot::channel::<Value>();

    let first = coordinator.operation("keywords", add_term("first"));
    let second = coordinator.operation("keywords", add_term("second"));

    let first_call = first.execute(|| async move { rx.await.map_err(|_| Error::QueueClosed) });
    let second_then_release = async {
      let value = second
        .execute(|| async { Ok(json!(["second confirmed"])) })
        .await
        .unwrap();
      tx.send(json!(["first confirmed"])).unwrap();
      value
    };
    let (first_result, second_value) = tokio::join!(first_call, second_then_release);

    assert_eq!(second_value, json!(["second confirmed"]));
    assert!(matches!(first_result.unwrap_err(), Error::Superseded { .. }));
    assert_eq!(cache.get("keywords"), Some(json!(["second confirmed"])));
    assert!(coordinator.active_keys().is_empty());
  }

  #[tokio::test]
  async fn test_rollback_fn_applied_to_restored_value() {
    let (cache, coordinator) = setup();
    cache.set("keywords", json!({"term": "rust", "pending": true}), None);

    let op = coordinator
      .operation("keywords", |v: &Value| v.clone())
      .rollback_fn(|mut v| {
        if let Some(obj) = v.as_object_mut() {
          obj.remove("pending");
        }
        v
      });
    let _ = op.execute(|| async { Err::<Value, _>(server_fault()) }).await;

    assert_eq!(cache.get("keywords"), Some(json!({"term": "rust"})));
  }

  #[tokio::test]
  async fn test_absent_key_gets_no_speculative_write() {
    let (cache, coordinator) = setup();
    let (tx, rx) = oneshot::channel::<Value>();

    let op = coordinator.operation("keywords", add_term("new"));
    let call = op.execute(|| async move { rx.await.map_err(|_| Error::QueueClosed) });
    let check = async {
      assert!(cache.entry("keywords").is_none());
      tx.send(json!(["created"])).unwrap();
    };
    let (result, _) = tokio::join!(call, check);

    assert!(result.is_ok());
    assert_eq!(cache.get("keywords"), Some(json!(["created"])));
  }

  #[tokio::test]
  async fn test_expired_entry_gets_no_speculative_write() {
    let clock = ManualClock::default();
    let cache = Arc::new(TtlCache::new(
      CacheConfig::default(),
      Arc::new(clock.clone()),
      Arc::new(RecordingSink::new()),
    ));
    let coordinator = OptimisticCoordinator::new(cache.clone());
    cache.set("keywords", json!(["old"]), Some(Duration::from_secs(1)));
    clock.advance(Duration::from_secs(2));
    let before = cache.entry("keywords").unwrap();

    let (tx, rx) = oneshot::channel::<Value>();
    let op = coordinator.operation("keywords", add_term("new"));
    let call = op.execute(|| async move {
      let _ = rx.await;
      Err::<Value, _>(server_fault())
    });
    let check = async {
      let entry = cache.entry("keywords").unwrap();
      assert!(!entry.is_pinned());
      assert_eq!(entry.value, json!(["old"]));
      tx.send(Value::Null).unwrap();
    };
    let (result, _) = tokio::join!(call, check);

    assert!(result.is_err());
    assert_eq!(cache.get("keywords"), None);
    assert_eq!(cache.entry("keywords").unwrap(), before);
  }
}
