use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::clock::to_chrono;

/// A cached value with its expiry and access metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
  pub key: String,
  pub value: V,
  pub created_at: DateTime<Utc>,
  /// `None` means the entry never expires
  pub ttl: Option<Duration>,
  pub access_count: u64,
  pub last_accessed_at: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
  /// Expired once `now >= created_at + ttl`.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at().is_some_and(|at| now >= at)
  }

  pub fn is_pinned(&self) -> bool {
    self.ttl.is_none()
  }

  pub fn expires_at(&self) -> Option<DateTime<Utc>> {
    self
      .ttl
      .and_then(|ttl| self.created_at.checked_add_signed(to_chrono(ttl)))
  }
}
