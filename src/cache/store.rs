//! In-memory key/value store backing every subscription.

use chrono::Utc;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::traits::{CacheEntry, Cacheable};

/// Type-erased slot in the store.
struct StoredEntry {
  data: Arc<dyn Any + Send + Sync>,
  timestamp: Instant,
  cached_at: chrono::DateTime<Utc>,
}

/// Key to `{ data, timestamp }` map shared by a [`QueryClient`](crate::QueryClient)
/// and all of its subscriptions.
///
/// Cloning is cheap and yields a handle to the same map. Every instance is
/// created explicitly, so tests get isolated stores.
#[derive(Clone, Default)]
pub struct CacheStore {
  entries: Arc<Mutex<HashMap<String, StoredEntry>>>,
}

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Get the entry for `key`.
  ///
  /// An entry written with a different value type is reported as a miss.
  pub fn get<T: Cacheable>(&self, key: &str) -> Option<CacheEntry<T>> {
    let entries = self.entries.lock();
    let stored = entries.get(key)?;
    let data = stored.data.downcast_ref::<T>()?.clone();
    Some(CacheEntry {
      key: key.to_string(),
      data,
      timestamp: stored.timestamp,
      cached_at: stored.cached_at,
    })
  }

  /// Write `data` under `key`, stamping the current time.
  ///
  /// The stored timestamp never moves backwards for a key.
  pub fn set<T: Cacheable>(&self, key: &str, data: T) {
    let mut entries = self.entries.lock();
    Self::write(&mut entries, key, data);
  }

  /// Replace the value under `key` with `updater(previous)`.
  ///
  /// The previous value is `None` if the key is missing or holds another type.
  /// Runs under the store lock, so `updater` must not touch the store.
  pub fn update<T, F>(&self, key: &str, updater: F) -> T
  where
    T: Cacheable,
    F: FnOnce(Option<T>) -> T,
  {
    let mut entries = self.entries.lock();
    let previous = entries
      .get(key)
      .and_then(|e| e.data.downcast_ref::<T>())
      .cloned();
    let next = updater(previous);
    Self::write(&mut entries, key, next.clone());
    next
  }

  fn write<T: Cacheable>(entries: &mut HashMap<String, StoredEntry>, key: &str, data: T) {
    let now = Instant::now();
    let timestamp = match entries.get(key) {
      Some(prev) if prev.timestamp > now => prev.timestamp,
      _ => now,
    };
    entries.insert(
      key.to_string(),
      StoredEntry {
        data: Arc::new(data),
        timestamp,
        cached_at: Utc::now(),
      },
    );
  }

  pub fn has(&self, key: &str) -> bool {
    self.entries.lock().contains_key(key)
  }

  /// Write time of the entry for `key`, regardless of its value type.
  pub fn timestamp(&self, key: &str) -> Option<Instant> {
    self.entries.lock().get(key).map(|e| e.timestamp)
  }

  /// Remove the entry for `key`. Returns whether anything was removed.
  pub fn delete(&self, key: &str) -> bool {
    self.entries.lock().remove(key).is_some()
  }

  /// Drop every entry (e.g. on logout).
  pub fn clear(&self) {
    let mut entries = self.entries.lock();
    debug!(count = entries.len(), "clearing cache store");
    entries.clear();
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
    keys.sort();
    keys
  }

  /// Remove entries older than the horizon returned for their key.
  ///
  /// `horizon` returns `None` for keys that must be kept regardless of age.
  /// Returns the number of removed entries.
  pub fn sweep<F>(&self, now: Instant, horizon: F) -> usize
  where
    F: Fn(&str) -> Option<Duration>,
  {
    let mut entries = self.entries.lock();
    let before = entries.len();
    entries.retain(|key, entry| match horizon(key) {
      Some(max_age) => now.saturating_duration_since(entry.timestamp) <= max_age,
      None => true,
    });
    before - entries.len()
  }
}

impl std::fmt::Debug for CacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheStore")
      .field("keys", &self.keys())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_set_and_get() {
    let store = CacheStore::new();
    assert!(store.get::<Vec<u32>>("tickets").is_none());
    assert!(!store.has("tickets"));

    store.set("tickets", vec![1u32, 2, 3]);

    let entry = store.get::<Vec<u32>>("tickets").unwrap();
    assert_eq!(entry.key, "tickets");
    assert_eq!(entry.data, vec![1, 2, 3]);
    assert!(store.has("tickets"));
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn test_type_mismatch_is_miss() {
    let store = CacheStore::new();
    store.set("count", 5u64);
    assert!(store.get::<String>("count").is_none());
    assert!(store.has("count"));
  }

  #[test]
  fn test_delete_and_clear() {
    let store = CacheStore::new();
    store.set("a", 1);
    store.set("b", 2);

    assert!(store.delete("a"));
    assert!(!store.delete("a"));
    assert!(store.get::<i32>("a").is_none());
    assert_eq!(store.keys(), vec!["b".to_string()]);

    store.clear();
    assert!(store.is_empty());
  }

  #[test]
  fn test_update_sees_previous_value() {
    let store = CacheStore::new();
    let first = store.update("list", |prev: Option<Vec<i32>>| {
      assert!(prev.is_none());
      vec![1]
    });
    assert_eq!(first, vec![1]);

    store.update("list", |prev: Option<Vec<i32>>| {
      let mut list = prev.unwrap_or_default();
      list.push(2);
      list
    });
    assert_eq!(store.get::<Vec<i32>>("list").unwrap().data, vec![1, 2]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timestamp_non_decreasing() {
    let store = CacheStore::new();
    store.set("k", 1);
    let first = store.timestamp("k").unwrap();

    tokio::time::advance(Duration::from_millis(50)).await;
    store.set("k", 2);
    let second = store.timestamp("k").unwrap();

    assert!(second >= first);
    assert_eq!(second - first, Duration::from_millis(50));
  }

  #[tokio::test(start_paused = true)]
  async fn test_sweep_respects_horizon() {
    let store = CacheStore::new();
    store.set("old", 1);
    tokio::time::advance(Duration::from_secs(120)).await;
    store.set("young", 2);
    store.set("pinned", 3);
    tokio::time::advance(Duration::from_secs(30)).await;

    let removed = store.sweep(Instant::now(), |key| match key {
      "pinned" => None,
      _ => Some(Duration::from_secs(60)),
    });

    assert_eq!(removed, 1);
    assert_eq!(store.keys(), vec!["pinned".to_string(), "young".to_string()]);
  }

  #[test]
  fn test_clones_share_entries() {
    let store = CacheStore::new();
    let other = store.clone();
    other.set("shared", "value".to_string());
    assert_eq!(store.get::<String>("shared").unwrap().data, "value");
  }
}
