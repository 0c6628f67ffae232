//! Query client: owns the cache store and the imperative cache operations.
//!
//! Subscriptions ([`Query`]) and mutations ([`Mutation`]) are created from a
//! client and share its store. Besides that, the client exposes the operations
//! that touch the store outside the normal fetch cycle: invalidation, direct
//! writes for optimistic updates, prefetching and garbage collection.

use color_eyre::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::{CacheStore, Cacheable, StalenessPolicy};
use crate::config::Config;
use crate::error::classify;
use crate::mutation::{Mutation, MutationOptions};
use crate::query::{Query, QueryOptions};
use crate::retry::RetryPolicy;

/// Default race timeout for a subscription's fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Client-wide settings applied when a query or mutation leaves them unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientDefaults {
  pub fetch_timeout: Duration,
  pub prefetch_timeout: Duration,
  pub query_retry: RetryPolicy,
  pub mutation_retry: RetryPolicy,
}

impl Default for ClientDefaults {
  fn default() -> Self {
    Self {
      fetch_timeout: DEFAULT_FETCH_TIMEOUT,
      prefetch_timeout: DEFAULT_FETCH_TIMEOUT,
      query_retry: RetryPolicy::query(),
      mutation_retry: RetryPolicy::mutation(),
    }
  }
}

/// Live subscriptions for one key, and the class they use.
#[derive(Debug, Clone)]
struct Observers {
  count: usize,
  class: Option<String>,
}

#[derive(Clone)]
pub struct QueryClient {
  store: CacheStore,
  policy: StalenessPolicy,
  defaults: ClientDefaults,
  observers: Arc<Mutex<HashMap<String, Observers>>>,
}

impl QueryClient {
  pub fn new(store: CacheStore, policy: StalenessPolicy) -> Self {
    Self {
      store,
      policy,
      defaults: ClientDefaults::default(),
      observers: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Build a client with a fresh store from loaded configuration.
  pub fn from_config(config: &Config) -> Self {
    Self::new(CacheStore::new(), config.staleness_policy()).with_defaults(config.client_defaults())
  }

  pub fn with_defaults(mut self, defaults: ClientDefaults) -> Self {
    self.defaults = defaults;
    self
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn policy(&self) -> &StalenessPolicy {
    &self.policy
  }

  pub fn defaults(&self) -> &ClientDefaults {
    &self.defaults
  }

  /// Subscribe to a key.
  ///
  /// The returned query already holds renderable data (cache or initial) and,
  /// unless the cached entry is fresh, has started a background fetch. Must be
  /// called from within a tokio runtime.
  pub fn query<T: Cacheable>(&self, options: QueryOptions<T>) -> Query<T> {
    Query::activate(self.clone(), options)
  }

  /// Create a mutation handle. Nothing runs until `mutate` is called.
  pub fn mutation<I, T>(&self, options: MutationOptions<I, T>) -> Mutation<I, T>
  where
    I: Clone + Send + 'static,
    T: Cacheable,
  {
    Mutation::new(self.clone(), options)
  }

  /// Remove the entry for `key`; the next activation treats it as cold.
  ///
  /// Live subscriptions keep what they show until they refresh.
  pub fn invalidate(&self, key: &str) -> bool {
    let removed = self.store.delete(key);
    debug!(key, removed, "invalidated cache entry");
    removed
  }

  pub fn invalidate_cache(&self, key: &str) -> bool {
    self.invalidate(key)
  }

  /// Drop every entry, e.g. on logout.
  pub fn clear(&self) {
    self.store.clear();
  }

  pub fn clear_cache(&self) {
    self.clear();
  }

  /// Write a value directly, bypassing any fetch.
  pub fn set_data<T: Cacheable>(&self, key: &str, value: T) {
    self.store.set(key, value);
  }

  /// Replace the value under `key` with `updater(previous)`.
  pub fn update_data<T, F>(&self, key: &str, updater: F) -> T
  where
    T: Cacheable,
    F: FnOnce(Option<T>) -> T,
  {
    self.store.update(key, updater)
  }

  pub fn get_data<T: Cacheable>(&self, key: &str) -> Option<T> {
    self.store.get(key).map(|entry| entry.data)
  }

  /// Warm the cache for `key` without a subscription.
  ///
  /// Runs a single attempt raced against `timeout` (client default when
  /// `None`). Failures are swallowed. Returns when the race settles; if the
  /// timer won, a later success is still written to the store.
  pub async fn prefetch<T, F, Fut>(&self, key: &str, fetcher: F, timeout: Option<Duration>)
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let timeout = timeout.unwrap_or(self.defaults.prefetch_timeout);
    let store = self.store.clone();
    let owned_key = key.to_string();
    let fetch = fetcher();

    let handle = tokio::spawn(async move {
      match fetch.await {
        Ok(data) => {
          store.set(&owned_key, data);
          debug!(key = %owned_key, "prefetched");
        }
        Err(report) => {
          let error = classify(&report);
          debug!(key = %owned_key, %error, "prefetch failed");
        }
      }
    });

    // Dropping the handle on timeout detaches the task rather than aborting it.
    if tokio::time::timeout(timeout, handle).await.is_err() {
      debug!(
        key,
        timeout_ms = timeout.as_millis() as u64,
        "prefetch timed out"
      );
    }
  }

  /// Remove entries that no subscription observes and that are older than
  /// their class's GC horizon. Returns the number of removed entries.
  pub fn collect_garbage(&self) -> usize {
    let observers = self.observers.lock().clone();
    let removed = self.store.sweep(Instant::now(), |key| match observers.get(key) {
      Some(o) if o.count > 0 => None,
      Some(o) => Some(self.policy.class(o.class.as_deref()).gc),
      None => Some(self.policy.default_class().gc),
    });

    // Released keys with nothing stored have no class left to remember.
    self
      .observers
      .lock()
      .retain(|key, o| o.count > 0 || self.store.has(key));

    if removed > 0 {
      debug!(removed, "collected unused cache entries");
    }
    removed
  }

  /// Number of live subscriptions on `key`.
  pub fn observer_count(&self, key: &str) -> usize {
    self
      .observers
      .lock()
      .get(key)
      .map(|o| o.count)
      .unwrap_or(0)
  }

  pub(crate) fn register_observer(&self, key: &str, class: Option<&str>) {
    let mut observers = self.observers.lock();
    let entry = observers.entry(key.to_string()).or_insert(Observers {
      count: 0,
      class: None,
    });
    entry.count += 1;
    if class.is_some() {
      entry.class = class.map(String::from);
    }
  }

  pub(crate) fn release_observer(&self, key: &str) {
    let mut observers = self.observers.lock();
    if let Some(entry) = observers.get_mut(key) {
      entry.count = entry.count.saturating_sub(1);
    }
  }
}

impl std::fmt::Debug for QueryClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryClient")
      .field("store", &self.store)
      .field("defaults", &self.defaults)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  fn client() -> QueryClient {
    QueryClient::new(CacheStore::new(), StalenessPolicy::default())
  }

  #[tokio::test]
  async fn test_set_get_invalidate() {
    let client = client();
    client.set_data("projects", vec!["alpha".to_string()]);
    assert_eq!(
      client.get_data::<Vec<String>>("projects"),
      Some(vec!["alpha".to_string()])
    );

    assert!(client.invalidate_cache("projects"));
    assert!(client.get_data::<Vec<String>>("projects").is_none());
    assert!(!client.invalidate("projects"));
  }

  #[tokio::test]
  async fn test_update_data_for_optimistic_write() {
    let client = client();
    client.set_data("tickets", vec![1u32, 2]);
    let updated = client.update_data("tickets", |prev: Option<Vec<u32>>| {
      let mut list = prev.unwrap_or_default();
      list.push(3);
      list
    });
    assert_eq!(updated, vec![1, 2, 3]);
    assert_eq!(client.get_data::<Vec<u32>>("tickets"), Some(vec![1, 2, 3]));
  }

  #[tokio::test]
  async fn test_clear_cache() {
    let client = client();
    client.set_data("a", 1);
    client.set_data("b", 2);
    client.clear_cache();
    assert!(client.store().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_prefetch_warms_cache() {
    let client = client();
    client
      .prefetch(
        "articles",
        || async {
          tokio::time::sleep(Duration::from_millis(20)).await;
          Ok(vec!["a".to_string(), "b".to_string()])
        },
        None,
      )
      .await;

    assert_eq!(
      client.get_data::<Vec<String>>("articles").map(|v| v.len()),
      Some(2)
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_prefetch_failure_is_swallowed() {
    let client = client();
    client.set_data("articles", 7u32);
    client
      .prefetch("articles", || async { Err::<u32, _>(eyre!("offline")) }, None)
      .await;
    assert_eq!(client.get_data::<u32>("articles"), Some(7));
  }

  #[tokio::test(start_paused = true)]
  async fn test_prefetch_late_success_still_commits() {
    let client = client();
    client
      .prefetch(
        "slow",
        || async {
          tokio::time::sleep(Duration::from_millis(500)).await;
          Ok(42u32)
        },
        Some(Duration::from_millis(100)),
      )
      .await;
    assert!(client.get_data::<u32>("slow").is_none());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(client.get_data::<u32>("slow"), Some(42));
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_prefetch_same_key() {
    let client = client();
    let started = Instant::now();

    tokio::join!(
      client.prefetch(
        "users",
        || async {
          tokio::time::sleep(Duration::from_millis(30)).await;
          Ok("first".to_string())
        },
        None,
      ),
      client.prefetch(
        "users",
        || async {
          tokio::time::sleep(Duration::from_millis(10)).await;
          Ok("second".to_string())
        },
        None,
      ),
    );

    let entry = client.store().get::<String>("users").unwrap();
    assert!(entry.data == "first" || entry.data == "second");
    assert!(entry.timestamp >= started);
    assert!(entry.timestamp <= Instant::now());
    assert_eq!(client.store().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_collect_garbage_skips_observed_keys() {
    let client = client();
    client.set_data("observed", 1u8);
    client.set_data("orphan", 2u8);
    client.register_observer("observed", Some("realtime"));

    tokio::time::advance(Duration::from_secs(10 * 60)).await;
    assert_eq!(client.collect_garbage(), 1);
    assert!(client.store().has("observed"));
    assert!(!client.store().has("orphan"));

    client.release_observer("observed");
    assert_eq!(client.observer_count("observed"), 0);
    // realtime entries linger for one minute once nobody observes them
    assert_eq!(client.collect_garbage(), 1);
    assert!(client.store().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_collect_garbage_keeps_young_entries() {
    let client = client();
    client.set_data("recent", 1u8);
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(client.collect_garbage(), 0);
    assert!(client.store().has("recent"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_collect_garbage_forgets_released_keys_without_entries() {
    let client = client();
    client.set_data("kept", 1u8);
    client.register_observer("kept", Some("users"));
    client.register_observer("never-stored", Some("tickets"));
    client.register_observer("still-watched", None);

    client.release_observer("kept");
    client.release_observer("never-stored");

    // Nothing is old enough to sweep, but the bookkeeping is still pruned.
    assert_eq!(client.collect_garbage(), 0);
    let observers = client.observers.lock();
    assert!(observers.contains_key("kept"));
    assert!(observers.contains_key("still-watched"));
    assert!(!observers.contains_key("never-stored"));
  }
}
