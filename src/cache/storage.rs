//! In-memory TTL cache with LRU eviction.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::debug;

use super::entry::CacheEntry;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::metrics::{MetricEvent, MetricsSink};
use crate::scheduler::{Scheduler, TimerHandle};

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
  /// Entries currently stored, including expired ones not yet swept
  pub size: usize,
  /// Stored entries that are already past their TTL
  pub expired: usize,
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  /// Entries removed by the sweep
  pub expirations: u64,
  pub hit_rate: f64,
}

struct Slot<V> {
  entry: CacheEntry<V>,
  /// Monotonic recency stamp; breaks ties between equal access times
  seq: u64,
}

struct Inner<V> {
  slots: HashMap<String, Slot<V>>,
  next_seq: u64,
  hits: u64,
  misses: u64,
  evictions: u64,
  expirations: u64,
}

impl<V> Inner<V> {
  fn bump(&mut self) -> u64 {
    self.next_seq += 1;
    self.next_seq
  }
}

/// Key → value store with per-entry expiry and bounded size.
///
/// Expiry is lazy: `get` reports an expired entry as missing but leaves it
/// in place until [`sweep`](TtlCache::sweep) runs, so offline fallbacks can
/// still reach it through [`get_stale`](TtlCache::get_stale).
pub struct TtlCache<V> {
  inner: Mutex<Inner<V>>,
  config: CacheConfig,
  clock: Arc<dyn Clock>,
  metrics: Arc<dyn MetricsSink>,
}

impl<V: Clone> TtlCache<V> {
  pub fn new(config: CacheConfig, clock: Arc<dyn Clock>, metrics: Arc<dyn MetricsSink>) -> Self {
    Self {
      inner: Mutex::new(Inner {
        slots: HashMap::new(),
        next_seq: 0,
        hits: 0,
        misses: 0,
        evictions: 0,
        expirations: 0,
      }),
      config,
      clock,
      metrics,
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner<V>> {
    // Nothing inside the lock can leave the map half-updated
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  /// Store `value` for `ttl`; `None` or zero uses the configured default.
  pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
    let ttl = match ttl {
      Some(ttl) if !ttl.is_zero() => ttl,
      _ => self.config.default_ttl(),
    };
    self.insert(key.into(), value, Some(ttl));
  }

  /// Store `value` without expiry. Used for speculative writes, which the
  /// sweep must never discard.
  pub fn set_pinned(&self, key: impl Into<String>, value: V) {
    self.insert(key.into(), value, None);
  }

  fn insert(&self, key: String, value: V, ttl: Option<Duration>) {
    let now = self.clock.now();
    let entry = CacheEntry {
      key: key.clone(),
      value,
      created_at: now,
      ttl,
      access_count: 0,
      last_accessed_at: now,
    };
    self.put_entry(entry);
  }

  fn put_entry(&self, entry: CacheEntry<V>) {
    let evicted = {
      let mut inner = self.lock();
      let evicted = if !inner.slots.contains_key(&entry.key)
        && inner.slots.len() >= self.config.max_entries.max(1)
      {
        let victim = Self::lru_victim(&inner);
        if let Some(victim) = &victim {
          inner.slots.remove(victim);
          inner.evictions += 1;
        }
        victim
      } else {
        None
      };
      let seq = inner.bump();
      inner.slots.insert(entry.key.clone(), Slot { entry, seq });
      evicted
    };

    if let Some(key) = evicted {
      debug!(key = %key, "Evicted least recently used entry");
      self.metrics.record(MetricEvent::CacheEviction { key });
    }
  }

  /// Least recently accessed entry, preferring entries that can expire.
  fn lru_victim(inner: &Inner<V>) -> Option<String> {
    let oldest = |pinned: bool| {
      inner
        .slots
        .iter()
        .filter(|(_, s)| s.entry.is_pinned() == pinned)
        .min_by_key(|(_, s)| (s.entry.last_accessed_at, s.seq))
        .map(|(k, _)| k.clone())
    };
    oldest(false).or_else(|| oldest(true))
  }

  /// Fresh value for `key`. Counts a hit or miss.
  pub fn get(&self, key: &str) -> Option<V> {
    let now = self.clock.now();
    let mut inner = self.lock();
    let seq = inner.next_seq + 1;

    let value = match inner.slots.get_mut(key) {
      Some(slot) if !slot.entry.is_expired(now) => {
        slot.entry.access_count += 1;
        slot.entry.last_accessed_at = now;
        slot.seq = seq;
        Some(slot.entry.value.clone())
      }
      _ => None,
    };

    if value.is_some() {
      inner.next_seq = seq;
      inner.hits += 1;
    } else {
      inner.misses += 1;
    }
    value
  }

  /// Value for `key` even if it has expired, with the time it was stored.
  /// Does not count as an access.
  pub fn get_stale(&self, key: &str) -> Option<(V, DateTime<Utc>)> {
    self
      .lock()
      .slots
      .get(key)
      .map(|s| (s.entry.value.clone(), s.entry.created_at))
  }

  /// Fresh value for `key` without counting or touching it.
  pub fn peek(&self, key: &str) -> Option<V> {
    let now = self.clock.now();
    self
      .lock()
      .slots
      .get(key)
      .filter(|s| !s.entry.is_expired(now))
      .map(|s| s.entry.value.clone())
  }

  pub fn created_at(&self, key: &str) -> Option<DateTime<Utc>> {
    self.lock().slots.get(key).map(|s| s.entry.created_at)
  }

  /// Full copy of the stored entry, expired or not.
  pub fn entry(&self, key: &str) -> Option<CacheEntry<V>> {
    self.lock().slots.get(key).map(|s| s.entry.clone())
  }

  /// Put back an entry captured with [`entry`](TtlCache::entry), keeping its
  /// timestamps and TTL.
  pub fn restore(&self, entry: CacheEntry<V>) {
    self.put_entry(entry);
  }

  pub fn contains_key(&self, key: &str) -> bool {
    let now = self.clock.now();
    self
      .lock()
      .slots
      .get(key)
      .is_some_and(|s| !s.entry.is_expired(now))
  }

  pub fn delete(&self, key: &str) -> bool {
    self.lock().slots.remove(key).is_some()
  }

  /// Remove every key matching `pattern`. Returns how many were removed.
  pub fn delete_matching(&self, pattern: &Regex) -> usize {
    let mut inner = self.lock();
    let before = inner.slots.len();
    inner.slots.retain(|key, _| !pattern.is_match(key));
    before - inner.slots.len()
  }

  pub fn clear(&self) {
    self.lock().slots.clear();
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.lock().slots.keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn len(&self) -> usize {
    self.lock().slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Remove every expired entry regardless of access pattern.
  pub fn sweep(&self) -> usize {
    let now = self.clock.now();
    let mut inner = self.lock();
    let before = inner.slots.len();
    inner.slots.retain(|_, s| !s.entry.is_expired(now));
    let removed = before - inner.slots.len();
    inner.expirations += removed as u64;
    if removed > 0 {
      debug!(removed, remaining = inner.slots.len(), "Swept expired cache entries");
    }
    removed
  }

  pub fn stats(&self) -> CacheStats {
    let now = self.clock.now();
    let inner = self.lock();
    let lookups = inner.hits + inner.misses;
    CacheStats {
      size: inner.slots.len(),
      expired: inner
        .slots
        .values()
        .filter(|s| s.entry.is_expired(now))
        .count(),
      hits: inner.hits,
      misses: inner.misses,
      evictions: inner.evictions,
      expirations: inner.expirations,
      hit_rate: if lookups == 0 {
        0.0
      } else {
        inner.hits as f64 / lookups as f64
      },
    }
  }
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
  /// Run [`sweep`](TtlCache::sweep) every configured interval until the
  /// handle is cancelled or the cache is dropped.
  pub fn start_sweeper(self: &Arc<Self>, scheduler: &dyn Scheduler) -> TimerHandle {
    let cache: Weak<Self> = Arc::downgrade(self);
    scheduler.every(
      self.config.sweep_interval(),
      Arc::new(move || {
        let cache = cache.clone();
        async move {
          if let Some(cache) = cache.upgrade() {
            cache.sweep();
          }
        }
        .boxed()
      }),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::metrics::RecordingSink;
  use crate::scheduler::ManualScheduler;
  use serde_json::{json, Value};

  fn cache_with(max_entries: usize) -> (TtlCache<Value>, ManualClock, Arc<RecordingSink>) {
    let clock = ManualClock::default();
    let sink = Arc::new(RecordingSink::new());
    let config = CacheConfig {
      max_entries,
      ..CacheConfig::default()
    };
    let cache = TtlCache::new(config, Arc::new(clock.clone()), sink.clone());
    (cache, clock, sink)
  }

  #[test]
  fn test_entry_expires_lazily() {
    let (cache, clock, _) = cache_with(10);
    cache.set("u:1", json!({"n": 1}), Some(Duration::from_millis(1000)));

    clock.advance(Duration::from_millis(999));
    assert_eq!(cache.get("u:1"), Some(json!({"n": 1})));

    clock.advance(Duration::from_millis(2));
    assert_eq!(cache.get("u:1"), None);
    // Still stored until the sweep runs
    assert_eq!(cache.len(), 1);
    assert!(cache.get_stale("u:1").is_some());
  }

  #[test]
  fn test_expires_exactly_at_ttl_boundary() {
    let (cache, clock, _) = cache_with(10);
    cache.set("k", json!(1), Some(Duration::from_millis(500)));
    clock.advance(Duration::from_millis(500));
    assert_eq!(cache.get("k"), None);
  }

  #[test]
  fn test_zero_ttl_uses_default() {
    let (cache, clock, _) = cache_with(10);
    cache.set("k", json!(1), Some(Duration::ZERO));
    let entry = cache.entry("k").unwrap();
    assert_eq!(entry.ttl, Some(cache.config().default_ttl()));

    clock.advance(cache.config().default_ttl() - Duration::from_millis(1));
    assert!(cache.get("k").is_some());
  }

  #[test]
  fn test_lru_evicts_oldest_access() {
    let (cache, clock, sink) = cache_with(2);
    cache.set("a", json!("a"), None);
    clock.advance(Duration::from_millis(10));
    cache.set("b", json!("b"), None);
    clock.advance(Duration::from_millis(10));

    cache.set("c", json!("c"), None);

    assert!(!cache.contains_key("a"));
    assert!(cache.contains_key("b"));
    assert!(cache.contains_key("c"));
    assert_eq!(cache.stats().evictions, 1);
    assert_eq!(
      sink.events(),
      vec![MetricEvent::CacheEviction { key: "a".into() }]
    );
  }

  #[test]
  fn test_get_protects_entry_from_eviction() {
    let (cache, _clock, _) = cache_with(2);
    // Same timestamp for everything: recency order alone decides
    cache.set("a", json!("a"), None);
    cache.set("b", json!("b"), None);
    assert!(cache.get("a").is_some());

    cache.set("c", json!("c"), None);

    assert!(cache.contains_key("a"));
    assert!(!cache.contains_key("b"));
  }

  #[test]
  fn test_overwrite_at_capacity_does_not_evict() {
    let (cache, _, _) = cache_with(2);
    cache.set("a", json!(1), None);
    cache.set("b", json!(2), None);
    cache.set("a", json!(3), None);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get("a"), Some(json!(3)));
  }

  #[test]
  fn test_pinned_entries_survive_sweep_and_eviction() {
    let (cache, clock, _) = cache_with(2);
    cache.set_pinned("speculative", json!("pending"));
    cache.set("a", json!("a"), Some(Duration::from_secs(1)));
    clock.advance(Duration::from_secs(2));

    assert_eq!(cache.sweep(), 1);
    assert_eq!(cache.get("speculative"), Some(json!("pending")));

    cache.set("b", json!("b"), None);
    cache.set("c", json!("c"), None);
    assert!(cache.contains_key("speculative"));
    assert!(!cache.contains_key("b"));
  }

  #[test]
  fn test_delete_matching_and_stats() {
    let (cache, _, _) = cache_with(10);
    cache.set("user:1", json!(1), None);
    cache.set("user:2", json!(2), None);
    cache.set("order:9", json!(9), None);

    let removed = cache.delete_matching(&Regex::new("^user:").unwrap());
    assert_eq!(removed, 2);
    assert_eq!(cache.keys(), vec!["order:9".to_string()]);

    cache.get("order:9");
    cache.get("user:1");
    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
  }

  #[test]
  fn test_restore_keeps_original_metadata() {
    let (cache, clock, _) = cache_with(10);
    cache.set("k", json!("original"), Some(Duration::from_secs(30)));
    let snapshot = cache.entry("k").unwrap();

    clock.advance(Duration::from_secs(5));
    cache.set_pinned("k", json!("speculative"));
    cache.restore(snapshot.clone());

    let restored = cache.entry("k").unwrap();
    assert_eq!(restored, snapshot);
  }

  #[tokio::test]
  async fn test_sweeper_runs_on_interval() {
    let clock = ManualClock::default();
    let scheduler = ManualScheduler::new(clock.clone());
    let config = CacheConfig {
      sweep_interval_ms: 60_000,
      ..CacheConfig::default()
    };
    let cache = Arc::new(TtlCache::new(
      config,
      Arc::new(clock.clone()),
      Arc::new(RecordingSink::new()),
    ));
    cache.set("k", json!(1), Some(Duration::from_secs(10)));

    let handle = cache.start_sweeper(&scheduler);
    scheduler.advance(Duration::from_secs(60)).await;

    assert!(cache.is_empty());
    assert_eq!(cache.stats().expirations, 1);
    handle.cancel();
  }
}
