//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Values that can live in the cache.
///
/// Anything cloneable and shareable across tasks qualifies; the blanket impl
/// means callers never implement this by hand.
pub trait Cacheable: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Cacheable for T {}

/// A cached value together with when it was written.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub key: String,
  pub data: T,
  /// Monotonic write time, used for freshness decisions
  pub timestamp: Instant,
  /// Wall-clock write time, for display only
  pub cached_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  /// Age of the entry relative to `now`.
  pub fn age_at(&self, now: Instant) -> std::time::Duration {
    now.saturating_duration_since(self.timestamp)
  }
}

/// Where the value currently shown by a subscription came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Caller-supplied initial data, nothing fetched or cached yet
  Initial,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, considered stale; a refresh is pending or failed
  CacheStale,
  /// Data committed by this subscription's own fetch
  Network,
}
