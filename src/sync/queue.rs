//! Durable queue of mutations with retry and backoff.

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::reconcile::reconcile;
use super::store::TaskStore;
use super::task::{FailedTask, NewTask, Priority, SyncTask};
use crate::cache::TtlCache;
use crate::clock::{to_chrono, Clock};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::invalidation::{DomainEvent, InvalidationGraph};
use crate::metrics::{MetricEvent, MetricsSink};
use crate::resilience::CircuitBreakerRegistry;
use crate::scheduler::{Job, Scheduler, TimerHandle};
use crate::transport::Transport;

/// Components the queue dispatches through and reports to.
#[derive(Clone)]
pub struct QueueDeps {
  pub transport: Arc<dyn Transport>,
  pub breakers: Arc<CircuitBreakerRegistry>,
  pub cache: Arc<TtlCache<Value>>,
  pub graph: Arc<InvalidationGraph>,
  pub store: Arc<dyn TaskStore>,
  pub scheduler: Arc<dyn Scheduler>,
  pub clock: Arc<dyn Clock>,
  pub metrics: Arc<dyn MetricsSink>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
  pub pending: usize,
  pub by_priority: BTreeMap<Priority, usize>,
  pub failed: usize,
  pub online: bool,
  pub processing: bool,
}

type Waiter = oneshot::Sender<Result<Value>>;

struct QueueInner {
  config: SyncConfig,
  deps: QueueDeps,
  pending: Mutex<Vec<SyncTask>>,
  failures: Mutex<Vec<FailedTask>>,
  waiters: Mutex<HashMap<String, Waiter>>,
  processing: AtomicBool,
  online: AtomicBool,
  /// A zero-delay processing job is already scheduled
  wake_scheduled: AtomicBool,
  shut_down: AtomicBool,
  periodic: Mutex<Option<TimerHandle>>,
}

/// Clears the processing flag when a run ends or is dropped.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Priority queue of [`SyncTask`]s. Cloning shares the same queue.
#[derive(Clone)]
pub struct SyncQueue {
  inner: Arc<QueueInner>,
}

impl SyncQueue {
  pub fn new(config: SyncConfig, deps: QueueDeps) -> Self {
    Self {
      inner: Arc::new(QueueInner {
        config,
        deps,
        pending: Mutex::new(Vec::new()),
        failures: Mutex::new(Vec::new()),
        waiters: Mutex::new(HashMap::new()),
        processing: AtomicBool::new(false),
        online: AtomicBool::new(true),
        wake_scheduled: AtomicBool::new(false),
        shut_down: AtomicBool::new(false),
        periodic: Mutex::new(None),
      }),
    }
  }

  /// Enqueue a mutation and return its task id.
  pub fn add_task(&self, new: NewTask) -> String {
    self.enqueue(new, None)
  }

  /// Enqueue a mutation and wait until it succeeds or fails for good.
  pub async fn submit(&self, new: NewTask) -> Result<Value> {
    let (tx, rx) = oneshot::channel();
    self.enqueue(new, Some(tx));
    rx.await.map_err(|_| Error::QueueClosed)?
  }

  fn enqueue(&self, new: NewTask, waiter: Option<Waiter>) -> String {
    let now = self.inner.deps.clock.now();
    let task = SyncTask::from_new(new, self.inner.config.max_attempts, now);
    let id = task.id.clone();

    if let Err(e) = self.inner.deps.store.save_task(&task) {
      warn!(task_id = %id, error = %e, "Failed to persist sync task");
    }
    if let Some(tx) = waiter {
      lock(&self.inner.waiters).insert(id.clone(), tx);
    }

    debug!(
      task_id = %id,
      kind = %task.kind,
      resource = %task.target_resource,
      priority = %task.priority,
      "Enqueued sync task"
    );
    lock(&self.inner.pending).push(task);

    self.trigger();
    id
  }

  /// Schedule an immediate processing run if online and idle.
  fn trigger(&self) {
    if !self.is_online()
      || self.inner.shut_down.load(Ordering::Acquire)
      || self.inner.processing.load(Ordering::Acquire)
    {
      return;
    }
    if self.inner.wake_scheduled.swap(true, Ordering::AcqRel) {
      return;
    }

    let weak = Arc::downgrade(&self.inner);
    let job: Job = Box::new(move || {
      async move {
        if let Some(inner) = weak.upgrade() {
          inner.wake_scheduled.store(false, Ordering::Release);
          SyncQueue { inner }.process_tasks().await;
        }
      }
      .boxed()
    });
    self.inner.deps.scheduler.after(Duration::ZERO, job);
  }

  fn process_job(weak: Weak<QueueInner>) -> Job {
    Box::new(move || {
      async move {
        if let Some(inner) = weak.upgrade() {
          SyncQueue { inner }.process_tasks().await;
        }
      }
      .boxed()
    })
  }

  /// Dispatch due tasks in batches until none remain. Returns how many
  /// dispatches were made. Overlapping calls return 0 immediately.
  pub async fn process_tasks(&self) -> usize {
    let inner = &self.inner;
    if !self.is_online() || inner.shut_down.load(Ordering::Acquire) {
      debug!("Skipping sync run while offline");
      return 0;
    }
    if inner
      .processing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return 0;
    }

    let mut dispatched = 0;
    {
      let _guard = ProcessingGuard(&inner.processing);
      loop {
        let batch = self.next_batch();
        if batch.is_empty() {
          break;
        }
        dispatched += batch.len();
        debug!(size = batch.len(), "Dispatching sync batch");
        join_all(batch.into_iter().map(|task| self.dispatch(task))).await;

        if !self.is_online() {
          break;
        }
      }
    }

    // A task enqueued while the last batch was finishing
    if self.has_due() {
      self.trigger();
    }
    dispatched
  }

  fn next_batch(&self) -> Vec<SyncTask> {
    let now = self.inner.deps.clock.now();
    let mut due: Vec<SyncTask> = lock(&self.inner.pending)
      .iter()
      .filter(|t| t.is_due(now))
      .cloned()
      .collect();
    sort_for_dispatch(&mut due);
    due.truncate(self.inner.config.max_concurrent_tasks.max(1));
    due
  }

  fn has_due(&self) -> bool {
    let now = self.inner.deps.clock.now();
    lock(&self.inner.pending).iter().any(|t| t.is_due(now))
  }

  async fn dispatch(&self, task: SyncTask) {
    let deps = &self.inner.deps;
    let breaker = deps.breakers.get(&task.target_resource);
    let transport = Arc::clone(&deps.transport);
    let request = task.request();

    debug!(
      task_id = %task.id,
      method = %request.method,
      resource = %request.resource,
      attempt = task.attempt + 1,
      "Dispatching sync task"
    );

    let result = breaker
      .call(move || async move { transport.execute(request).await })
      .await;

    match result {
      Ok(response) => self.complete(task, response),
      // Never reached the network; not an attempt
      Err(e) if e.is_open() => self.defer(&task.id, breaker.retry_after(), Error::from(e)),
      Err(e) => self.fail(&task.id, Error::from(e)),
    }
  }

  /// Hold a task rejected by its circuit until the breaker can admit a
  /// trial call, or `base_delay` while a half-open trial is running.
  fn defer(&self, task_id: &str, wait: Option<Duration>, err: Error) {
    let deps = &self.inner.deps;
    let now = deps.clock.now();
    let delay = wait.unwrap_or_else(|| self.inner.config.base_delay());

    let task = {
      let mut pending = lock(&self.inner.pending);
      let Some(task) = pending.iter_mut().find(|t| t.id == task_id) else {
        return;
      };
      task.last_error = Some(err.to_string());
      task.next_attempt_at = Some(now + to_chrono(delay));
      task.clone()
    };

    if let Err(e) = deps.store.save_task(&task) {
      warn!(task_id = %task.id, error = %e, "Failed to persist deferred task");
    }
    debug!(
      task_id = %task.id,
      resource = %task.target_resource,
      retry_in = ?delay,
      "Circuit open, deferring sync task"
    );

    if !self.inner.shut_down.load(Ordering::Acquire) {
      deps
        .scheduler
        .after(delay, Self::process_job(Arc::downgrade(&self.inner)));
    }
  }

  fn complete(&self, task: SyncTask, response: Value) {
    let deps = &self.inner.deps;
    let now = deps.clock.now();
    let resource = &task.target_resource;

    lock(&self.inner.pending).retain(|t| t.id != task.id);
    if let Err(e) = deps.store.remove_task(&task.id) {
      warn!(task_id = %task.id, error = %e, "Failed to remove completed task from store");
    }

    // A pinned entry belongs to an optimistic operation, which writes the
    // confirmed value itself
    let speculative = deps.cache.entry(resource).is_some_and(|e| e.is_pinned());
    if !speculative {
      let current = deps.cache.peek(resource);
      match reconcile(current, task.kind, task.payload.as_ref(), &response) {
        Some(Value::Null) => {
          deps.cache.delete(resource);
        }
        Some(next) => deps.cache.set(resource.clone(), next, None),
        None => {}
      }
    }

    deps.graph.process_event(&DomainEvent::mutation(
      resource,
      task.kind.action(),
      resource,
      now,
    ));

    let attempts = task.attempt + 1;
    deps.metrics.record(MetricEvent::TaskCompleted {
      resource: resource.clone(),
      attempts,
    });
    info!(task_id = %task.id, kind = %task.kind, resource = %resource, attempts, "Sync task completed");

    self.settle(&task.id, Ok(response));
  }

  fn fail(&self, task_id: &str, err: Error) {
    let deps = &self.inner.deps;
    let now = deps.clock.now();
    let message = err.to_string();

    let (task, delay) = {
      let mut pending = lock(&self.inner.pending);
      let Some(task) = pending.iter_mut().find(|t| t.id == task_id) else {
        return;
      };
      task.attempt += 1;
      task.last_error = Some(message.clone());
      task.last_attempt_at = Some(now);

      let terminal = !err.is_retryable() || task.attempt >= task.max_attempts;
      if terminal {
        let task = task.clone();
        pending.retain(|t| t.id != task_id);
        (task, None)
      } else {
        let delay = self.inner.config.base_delay().saturating_mul(task.attempt);
        task.next_attempt_at = Some(now + to_chrono(delay));
        (task.clone(), Some(delay))
      }
    };

    let Some(delay) = delay else {
      self.record_terminal_failure(task, err, now);
      return;
    };

    if let Err(e) = deps.store.save_task(&task) {
      warn!(task_id = %task.id, error = %e, "Failed to persist retry state");
    }
    warn!(
      task_id = %task.id,
      resource = %task.target_resource,
      attempt = task.attempt,
      max_attempts = task.max_attempts,
      retry_in = ?delay,
      error = %message,
      "Sync task failed, retrying"
    );

    if !self.inner.shut_down.load(Ordering::Acquire) {
      deps
        .scheduler
        .after(delay, Self::process_job(Arc::downgrade(&self.inner)));
    }
  }

  fn record_terminal_failure(&self, task: SyncTask, err: Error, now: chrono::DateTime<Utc>) {
    let deps = &self.inner.deps;
    let failed = FailedTask {
      task: task.clone(),
      error: err.to_string(),
      failed_at: now,
    };

    if let Err(e) = deps.store.record_failure(&failed) {
      warn!(task_id = %task.id, error = %e, "Failed to persist task failure");
    }
    lock(&self.inner.failures).push(failed);

    deps.metrics.record(MetricEvent::TaskFailed {
      task_id: task.id.clone(),
      resource: task.target_resource.clone(),
      attempts: task.attempt,
    });
    error!(
      task_id = %task.id,
      resource = %task.target_resource,
      attempts = task.attempt,
      error = %err,
      "Sync task failed permanently"
    );

    let outcome = if err.is_retryable() {
      Error::RetriesExhausted {
        task_id: task.id.clone(),
        attempts: task.attempt,
        last_error: err.to_string(),
      }
    } else {
      err
    };
    self.settle(&task.id, Err(outcome));
  }

  fn settle(&self, task_id: &str, outcome: Result<Value>) {
    if let Some(tx) = lock(&self.inner.waiters).remove(task_id) {
      // Receiver may have been dropped; nothing to do then
      let _ = tx.send(outcome);
    }
  }

  pub fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::Acquire)
  }

  /// Connectivity change. Going online starts a processing run.
  pub fn set_online(&self, online: bool) {
    let was = self.inner.online.swap(online, Ordering::AcqRel);
    if online && !was {
      info!("Back online, resuming sync");
      self.trigger();
    } else if !online && was {
      info!("Offline, pausing sync");
    }
  }

  /// Go online and run one processing pass in the caller's task.
  pub async fn flush(&self) -> usize {
    self.inner.online.store(true, Ordering::Release);
    self.process_tasks().await
  }

  /// The app became visible again.
  pub fn notify_visible(&self) {
    debug!("Visibility regained");
    self.trigger();
  }

  /// Start the periodic processing timer. Calling again replaces it.
  pub fn start(&self) {
    let weak = Arc::downgrade(&self.inner);
    let handle = self.inner.deps.scheduler.every(
      self.inner.config.sync_interval(),
      Arc::new(move || {
        let weak = weak.clone();
        async move {
          if let Some(inner) = weak.upgrade() {
            SyncQueue { inner }.process_tasks().await;
          }
        }
        .boxed()
      }),
    );

    if let Some(old) = lock(&self.inner.periodic).replace(handle) {
      old.cancel();
    }
    self.inner.shut_down.store(false, Ordering::Release);
    info!(interval = ?self.inner.config.sync_interval(), "Sync queue started");
    self.trigger();
  }

  /// Cancel the periodic timer and stop scheduling retries. Pending tasks
  /// stay in the queue and the store.
  pub fn shutdown(&self) {
    self.inner.shut_down.store(true, Ordering::Release);
    if let Some(handle) = lock(&self.inner.periodic).take() {
      handle.cancel();
    }
    info!(pending = lock(&self.inner.pending).len(), "Sync queue shut down");
  }

  /// Reload pending and failed tasks from the store. Returns how many
  /// pending tasks were added.
  pub fn restore(&self) -> usize {
    let store = &self.inner.deps.store;

    let pending = match store.load_pending() {
      Ok(tasks) => tasks,
      Err(e) => {
        warn!(error = %e, "Failed to load pending tasks");
        Vec::new()
      }
    };
    let restored = {
      let mut current = lock(&self.inner.pending);
      let known: HashSet<String> = current.iter().map(|t| t.id.clone()).collect();
      let before = current.len();
      current.extend(pending.into_iter().filter(|t| !known.contains(&t.id)));
      current.len() - before
    };

    match store.load_failures() {
      Ok(failures) => {
        let mut current = lock(&self.inner.failures);
        let known: HashSet<String> = current.iter().map(|f| f.task.id.clone()).collect();
        current.extend(failures.into_iter().filter(|f| !known.contains(&f.task.id)));
      }
      Err(e) => warn!(error = %e, "Failed to load task failures"),
    }

    if restored > 0 {
      info!(restored, "Restored pending sync tasks");
      self.trigger();
    }
    restored
  }

  pub fn stats(&self) -> SyncStats {
    let pending = lock(&self.inner.pending);
    let mut by_priority = BTreeMap::new();
    for task in pending.iter() {
      *by_priority.entry(task.priority).or_insert(0) += 1;
    }

    SyncStats {
      pending: pending.len(),
      by_priority,
      failed: lock(&self.inner.failures).len(),
      online: self.is_online(),
      processing: self.inner.processing.load(Ordering::Acquire),
    }
  }

  /// Pending tasks in dispatch order.
  pub fn pending_tasks(&self) -> Vec<SyncTask> {
    let mut tasks = lock(&self.inner.pending).clone();
    sort_for_dispatch(&mut tasks);
    tasks
  }

  pub fn failures(&self) -> Vec<FailedTask> {
    lock(&self.inner.failures).clone()
  }

  pub fn clear_failures(&self) {
    lock(&self.inner.failures).clear();
    if let Err(e) = self.inner.deps.store.clear_failures() {
      warn!(error = %e, "Failed to clear stored task failures");
    }
  }
}

/// Highest priority first, then oldest.
fn sort_for_dispatch(tasks: &mut [SyncTask]) {
  tasks.sort_by(|a, b| {
    b.priority
      .cmp(&a.priority)
      .then_with(|| a.created_at.cmp(&b.created_at))
  });
}
