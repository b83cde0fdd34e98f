//! Provenance of values handed out by the query layer.

use chrono::{DateTime, Utc};

/// Where a read was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  Network,
  /// Live entry within its TTL
  CacheFresh,
  /// Expired entry; the resource's circuit was open so the network was skipped
  CacheStale,
  /// Expired entry; the network call failed
  Offline,
}

impl CacheSource {
  pub fn is_cached(self) -> bool {
    self != CacheSource::Network
  }

  /// The value may be older than its TTL allows.
  pub fn is_degraded(self) -> bool {
    matches!(self, CacheSource::CacheStale | CacheSource::Offline)
  }
}

/// A value plus where it came from and, for cached values, when it was stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn cached(data: T, source: CacheSource, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source,
      cached_at: Some(cached_at),
    }
  }

  pub fn is_from_cache(&self) -> bool {
    self.source.is_cached()
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}
