//! Timer abstraction for sweeps, retries and periodic sync.
//!
//! Components never call `tokio::spawn` + `sleep` directly; they go through a
//! [`Scheduler`] so tests can drive time with [`ManualScheduler`] and shutdown
//! can cancel everything through [`TimerHandle`].

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{to_chrono, Clock, ManualClock};

/// One-shot job.
pub type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Job run on every tick of a periodic timer.
pub type RepeatingJob = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Cancels a scheduled job. Dropping the handle does not cancel.
#[derive(Debug, Clone)]
pub struct TimerHandle {
  cancelled: Arc<AtomicBool>,
  abort: Option<tokio::task::AbortHandle>,
}

impl TimerHandle {
  fn new(abort: Option<tokio::task::AbortHandle>) -> Self {
    Self {
      cancelled: Arc::new(AtomicBool::new(false)),
      abort,
    }
  }

  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::Release);
    if let Some(abort) = &self.abort {
      abort.abort();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Acquire)
  }
}

pub trait Scheduler: Send + Sync {
  /// Run `job` once after `delay`.
  fn after(&self, delay: Duration, job: Job) -> TimerHandle;

  /// Run `job` every `period`, first run one period from now.
  fn every(&self, period: Duration, job: RepeatingJob) -> TimerHandle;
}

/// Scheduler backed by tokio timers. Must be used inside a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
  fn after(&self, delay: Duration, job: Job) -> TimerHandle {
    let task = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      job().await;
    });
    TimerHandle::new(Some(task.abort_handle()))
  }

  fn every(&self, period: Duration, job: RepeatingJob) -> TimerHandle {
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      // interval fires immediately on the first tick
      ticker.tick().await;
      loop {
        ticker.tick().await;
        job().await;
      }
    });
    TimerHandle::new(Some(task.abort_handle()))
  }
}

enum ManualJob {
  Once(Job),
  Every { period: Duration, job: RepeatingJob },
}

struct ManualEntry {
  due: DateTime<Utc>,
  seq: u64,
  handle: TimerHandle,
  job: ManualJob,
}

#[derive(Default)]
struct ManualState {
  entries: Vec<ManualEntry>,
  next_seq: u64,
  delays: Vec<Duration>,
}

/// Deterministic scheduler for tests. Jobs run only inside [`advance`].
///
/// [`advance`]: ManualScheduler::advance
#[derive(Clone)]
pub struct ManualScheduler {
  clock: ManualClock,
  state: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
  pub fn new(clock: ManualClock) -> Self {
    Self {
      clock,
      state: Arc::new(Mutex::new(ManualState::default())),
    }
  }

  pub fn clock(&self) -> &ManualClock {
    &self.clock
  }

  fn state(&self) -> std::sync::MutexGuard<'_, ManualState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn push(&self, due: DateTime<Utc>, job: ManualJob) -> TimerHandle {
    let handle = TimerHandle::new(None);
    let mut state = self.state();
    let seq = state.next_seq;
    state.next_seq += 1;
    state.entries.push(ManualEntry {
      due,
      seq,
      handle: handle.clone(),
      job,
    });
    handle
  }

  /// Delays passed to `after`, in call order.
  pub fn scheduled_delays(&self) -> Vec<Duration> {
    self.state().delays.clone()
  }

  /// Jobs still waiting to fire (cancelled ones excluded).
  pub fn pending(&self) -> usize {
    self
      .state()
      .entries
      .iter()
      .filter(|e| !e.handle.is_cancelled())
      .count()
  }

  /// Move the clock forward, running every job that falls due on the way
  /// in due order. Jobs scheduled by running jobs are honoured too.
  pub async fn advance(&self, by: Duration) {
    let target = self.clock.now() + to_chrono(by);

    loop {
      let next = {
        let mut state = self.state();
        state.entries.retain(|e| !e.handle.is_cancelled());
        let idx = state
          .entries
          .iter()
          .enumerate()
          .filter(|(_, e)| e.due <= target)
          .min_by_key(|(_, e)| (e.due, e.seq))
          .map(|(i, _)| i);
        idx.map(|i| state.entries.swap_remove(i))
      };

      let Some(entry) = next else { break };
      if entry.due > self.clock.now() {
        self.clock.set(entry.due);
      }

      match entry.job {
        ManualJob::Once(job) => job().await,
        ManualJob::Every { period, job } => {
          job().await;
          if !entry.handle.is_cancelled() {
            let mut state = self.state();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push(ManualEntry {
              due: entry.due + to_chrono(period),
              seq,
              handle: entry.handle,
              job: ManualJob::Every { period, job },
            });
          }
        }
      }
    }

    if target > self.clock.now() {
      self.clock.set(target);
    }
  }
}

impl Scheduler for ManualScheduler {
  fn after(&self, delay: Duration, job: Job) -> TimerHandle {
    self.state().delays.push(delay);
    let due = self.clock.now() + to_chrono(delay);
    self.push(due, ManualJob::Once(job))
  }

  fn every(&self, period: Duration, job: RepeatingJob) -> TimerHandle {
    let due = self.clock.now() + to_chrono(period);
    self.push(due, ManualJob::Every { period, job })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::FutureExt;
  use std::sync::atomic::AtomicU32;

  fn counter_job(counter: &Arc<AtomicU32>) -> Job {
    let counter = Arc::clone(counter);
    Box::new(move || {
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
      }
      .boxed()
    })
  }

  #[tokio::test]
  async fn test_manual_after_fires_once_when_due() {
    let scheduler = ManualScheduler::new(ManualClock::default());
    let counter = Arc::new(AtomicU32::new(0));

    scheduler.after(Duration::from_secs(5), counter_job(&counter));

    scheduler.advance(Duration::from_secs(4)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    scheduler.advance(Duration::from_secs(1)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    scheduler.advance(Duration::from_secs(60)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.scheduled_delays(), vec![Duration::from_secs(5)]);
  }

  #[tokio::test]
  async fn test_manual_every_repeats_until_cancelled() {
    let scheduler = ManualScheduler::new(ManualClock::default());
    let counter = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&counter);
    let handle = scheduler.every(
      Duration::from_secs(10),
      Arc::new(move || {
        let c = Arc::clone(&c);
        async move {
          c.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
      }),
    );

    scheduler.advance(Duration::from_secs(35)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    handle.cancel();
    scheduler.advance(Duration::from_secs(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.pending(), 0);
  }

  #[tokio::test]
  async fn test_tokio_after_runs_job() {
    let counter = Arc::new(AtomicU32::new(0));
    TokioScheduler.after(Duration::from_millis(5), counter_job(&counter));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }
}
