//! Cache layer that orchestrates caching logic with network fetching.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::TtlCache;
use super::traits::{CacheResult, CacheSource};
use crate::error::{Error, Result, TransportError};
use crate::resilience::{CircuitBreakerError, CircuitBreakerRegistry};
use crate::transport::{Request, Transport};

/// Read path: cache first, then the network through the resource's
/// circuit breaker, then whatever the cache still holds.
#[derive(Clone)]
pub struct QueryLayer {
  cache: Arc<TtlCache<Value>>,
  breakers: Arc<CircuitBreakerRegistry>,
  transport: Arc<dyn Transport>,
}

impl QueryLayer {
  pub fn new(
    cache: Arc<TtlCache<Value>>,
    breakers: Arc<CircuitBreakerRegistry>,
    transport: Arc<dyn Transport>,
  ) -> Self {
    Self {
      cache,
      breakers,
      transport,
    }
  }

  /// `GET resource`, cached under the resource path.
  pub async fn fetch(&self, resource: &str) -> Result<CacheResult<Value>> {
    let transport = Arc::clone(&self.transport);
    let request = Request::get(resource);
    self
      .fetch_with(resource, resource, || async move {
        transport.execute(request).await
      })
      .await
  }

  /// Like [`fetch`](Self::fetch) but skips a fresh cache entry.
  pub async fn refresh(&self, resource: &str) -> Result<CacheResult<Value>> {
    self.cache.delete(resource);
    self.fetch(resource).await
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, fetch through the breaker for `resource`
  /// 3. On failure, return the expired entry if one is still held
  /// 4. Update cache with new data
  pub async fn fetch_with<F, Fut>(
    &self,
    key: &str,
    resource: &str,
    fetcher: F,
  ) -> Result<CacheResult<Value>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, TransportError>>,
  {
    if let Some(data) = self.cache.get(key) {
      if let Some(cached_at) = self.cache.created_at(key) {
        debug!(key = %key, "Cache hit");
        return Ok(CacheResult::cached(data, CacheSource::CacheFresh, cached_at));
      }
    }

    let breaker = self.breakers.get(resource);
    match breaker.call(fetcher).await {
      Ok(data) => {
        self.cache.set(key, data.clone(), None);
        Ok(CacheResult::network(data))
      }
      Err(e) => {
        let Some((data, cached_at)) = self.cache.get_stale(key) else {
          return Err(Error::from(e));
        };
        warn!(key = %key, error = %e, "Serving expired cache entry");
        // Open circuit: the network was never tried
        let source = if matches!(e, CircuitBreakerError::CircuitOpen { .. }) {
          CacheSource::CacheStale
        } else {
          CacheSource::Offline
        };
        Ok(CacheResult::cached(data, source, cached_at))
      }
    }
  }
}
