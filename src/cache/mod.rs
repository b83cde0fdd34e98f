//! In-memory caching with TTL expiry and an offline-capable read path.
//!
//! - [`TtlCache`] stores values with per-entry expiry and LRU eviction
//! - [`QueryLayer`] reads through the cache, falling back to expired
//!   entries when the network or the resource's circuit is unavailable

mod entry;
mod layer;
mod storage;
mod traits;

pub use entry::CacheEntry;
pub use layer::QueryLayer;
pub use storage::{CacheStats, TtlCache};
pub use traits::{CacheResult, CacheSource};
