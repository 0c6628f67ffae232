//! Async query abstraction: instant render plus background sync.
//!
//! Inspired by TanStack Query, a [`Query<T>`] is one consumer's subscription
//! to a cache key. Activation is synchronous and always leaves renderable
//! data behind (the cached value, or the caller's initial data). If the
//! cached value is not fresh, a background task runs the fetcher under the
//! retry policy, races it against a timeout and writes the result back to the
//! store.
//!
//! # Example
//!
//! ```ignore
//! let http = http.clone();
//! let mut query = client.query(
//!   QueryOptions::new("dashboard-tickets", Vec::new(), move || {
//!     let http = http.clone();
//!     async move { http.tickets().await }
//!   })
//!   .class("tickets"),
//! );
//!
//! // In event loop tick
//! if query.poll() {
//!   // State changed, trigger re-render
//! }
//!
//! // In render
//! let snapshot = query.snapshot();
//! render(&snapshot.data);
//! if snapshot.is_fallback {
//!   render_notice("showing cached data");
//! }
//! ```
//!
//! Only one fetch per subscription is relevant at a time. Every fetch carries
//! the generation it was started under; starting another fetch, changing the
//! key or dropping the query bumps the generation, and results from older
//! generations are discarded instead of committed.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{is_fresh_at, CacheSource, CacheStore, Cacheable};
use crate::client::QueryClient;
use crate::error::ClassifiedError;
use crate::retry::RetryPolicy;

/// A factory function that creates futures for fetching data
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

pub type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ClassifiedError) + Send + Sync>;

/// Subscription configuration.
pub struct QueryOptions<T> {
  key: String,
  initial_data: T,
  fetcher: Fetcher<T>,
  class: Option<String>,
  stale_time: Option<Duration>,
  timeout: Option<Duration>,
  fetch_on_activate: bool,
  retry: Option<RetryPolicy>,
  on_success: Option<SuccessCallback<T>>,
  on_error: Option<ErrorCallback>,
}

impl<T: Cacheable> QueryOptions<T> {
  /// Create options for `key`.
  ///
  /// The fetcher is a closure that returns a future. It is called once per
  /// attempt, so it may run several times for one refresh.
  pub fn new<F, Fut>(key: impl Into<String>, initial_data: T, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    Self {
      key: key.into(),
      initial_data,
      fetcher: Arc::new(move || fetcher().boxed()),
      class: None,
      stale_time: None,
      timeout: None,
      fetch_on_activate: true,
      retry: None,
      on_success: None,
      on_error: None,
    }
  }

  /// Staleness class name (e.g. "tickets"); unknown names use the default.
  pub fn class(mut self, class: impl Into<String>) -> Self {
    self.class = Some(class.into());
    self
  }

  /// Override the class TTL for this subscription.
  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn fetch_on_activate(mut self, enabled: bool) -> Self {
    self.fetch_on_activate = enabled;
    self
  }

  pub fn retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = Some(retry);
    self
  }

  pub fn on_success<F>(mut self, callback: F) -> Self
  where
    F: Fn(&T) + Send + Sync + 'static,
  {
    self.on_success = Some(Arc::new(callback));
    self
  }

  pub fn on_error<F>(mut self, callback: F) -> Self
  where
    F: Fn(&ClassifiedError) + Send + Sync + 'static,
  {
    self.on_error = Some(Arc::new(callback));
    self
  }
}

/// What a consumer renders from.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot<T> {
  pub data: T,
  pub source: CacheSource,
  /// No cache entry existed and the first fetch is outstanding
  pub is_loading: bool,
  /// A background fetch is outstanding while data is shown
  pub is_refreshing: bool,
  /// The shown data is not confirmed fresh
  pub is_stale: bool,
  /// The last fetch failed and the shown data is older than that attempt
  pub is_fallback: bool,
  pub error: Option<ClassifiedError>,
  /// Wall-clock time of the last commit by this subscription
  pub updated_at: Option<DateTime<Utc>>,
}

impl<T> QuerySnapshot<T> {
  fn initial(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Initial,
      is_loading: false,
      is_refreshing: false,
      is_stale: true,
      is_fallback: false,
      error: None,
      updated_at: None,
    }
  }
}

/// Mutable part of a subscription, shared with its fetch tasks.
struct Shared<T> {
  key: String,
  generation: u64,
  snapshot: QuerySnapshot<T>,
}

/// Resolved, immutable per-subscription settings.
struct Settings<T> {
  initial_data: T,
  fetcher: Fetcher<T>,
  class: Option<String>,
  ttl: Duration,
  timeout: Duration,
  fetch_on_activate: bool,
  retry: RetryPolicy,
  on_success: Option<SuccessCallback<T>>,
  on_error: Option<ErrorCallback>,
}

/// One consumer's subscription to a cache key.
pub struct Query<T: Cacheable> {
  client: QueryClient,
  settings: Arc<Settings<T>>,
  shared: Arc<Mutex<Shared<T>>>,
  notify: Arc<watch::Sender<u64>>,
  changes: watch::Receiver<u64>,
}

impl<T: Cacheable> Query<T> {
  pub(crate) fn activate(client: QueryClient, options: QueryOptions<T>) -> Self {
    let ttl = options
      .stale_time
      .unwrap_or_else(|| client.policy().class(options.class.as_deref()).ttl);
    let settings = Settings {
      initial_data: options.initial_data.clone(),
      fetcher: options.fetcher,
      class: options.class,
      ttl,
      timeout: options.timeout.unwrap_or(client.defaults().fetch_timeout),
      fetch_on_activate: options.fetch_on_activate,
      retry: options.retry.unwrap_or(client.defaults().query_retry),
      on_success: options.on_success,
      on_error: options.on_error,
    };

    let (notify, changes) = watch::channel(0);
    client.register_observer(&options.key, settings.class.as_deref());

    let query = Self {
      client,
      shared: Arc::new(Mutex::new(Shared {
        key: options.key,
        generation: 0,
        snapshot: QuerySnapshot::initial(options.initial_data),
      })),
      settings: Arc::new(settings),
      notify: Arc::new(notify),
      changes,
    };
    query.run_activation();
    query
  }

  /// Seed from cache or initial data, and start a fetch unless fresh.
  fn run_activation(&self) -> Option<oneshot::Receiver<()>> {
    let key = self.key();
    let entry = self.client.store().get::<T>(&key);

    {
      let mut shared = self.shared.lock();
      let snapshot = &mut shared.snapshot;
      snapshot.error = None;
      snapshot.is_fallback = false;
      snapshot.is_refreshing = false;

      match entry {
        Some(entry) if is_fresh_at(entry.timestamp, self.settings.ttl, Instant::now()) => {
          snapshot.data = entry.data;
          snapshot.source = CacheSource::CacheFresh;
          snapshot.is_loading = false;
          snapshot.is_stale = false;
          snapshot.updated_at = Some(entry.cached_at);
          drop(shared);
          debug!(key = %key, "cache fresh, skipping fetch");
          self.bump();
          return None;
        }
        Some(entry) => {
          snapshot.data = entry.data;
          snapshot.source = CacheSource::CacheStale;
          snapshot.is_loading = false;
          snapshot.is_stale = true;
          snapshot.updated_at = Some(entry.cached_at);
        }
        None => {
          snapshot.data = self.settings.initial_data.clone();
          snapshot.source = CacheSource::Initial;
          snapshot.is_loading = self.settings.fetch_on_activate;
          snapshot.is_stale = true;
          snapshot.updated_at = None;
        }
      }
    }

    if self.settings.fetch_on_activate {
      Some(self.start_fetch())
    } else {
      self.bump();
      None
    }
  }

  /// Start a background fetch, superseding any outstanding one.
  ///
  /// The returned receiver fires when the fetch first settles (success,
  /// failure or timeout).
  fn start_fetch(&self) -> oneshot::Receiver<()> {
    let (done_tx, done_rx) = oneshot::channel();

    let (key, generation) = {
      let mut shared = self.shared.lock();
      shared.generation += 1;
      if !shared.snapshot.is_loading {
        shared.snapshot.is_refreshing = true;
      }
      (shared.key.clone(), shared.generation)
    };
    self.bump();

    debug!(key = %key, generation, "starting fetch");
    let task = FetchTask {
      key,
      generation,
      shared: Arc::clone(&self.shared),
      notify: Arc::clone(&self.notify),
      store: self.client.store().clone(),
      settings: Arc::clone(&self.settings),
    };
    tokio::spawn(task.run(done_tx));

    done_rx
  }

  fn bump(&self) {
    self.notify.send_modify(|version| *version += 1);
  }

  /// Invalidate outstanding fetches without starting a new one.
  fn cancel(&self) {
    self.shared.lock().generation += 1;
  }

  pub fn key(&self) -> String {
    self.shared.lock().key.clone()
  }

  /// Get a copy of the current state.
  pub fn snapshot(&self) -> QuerySnapshot<T> {
    self.shared.lock().snapshot.clone()
  }

  /// Get the data currently shown. Never empty: cache, initial or fetched.
  pub fn data(&self) -> T {
    self.shared.lock().snapshot.data.clone()
  }

  pub fn is_loading(&self) -> bool {
    self.shared.lock().snapshot.is_loading
  }

  pub fn is_refreshing(&self) -> bool {
    self.shared.lock().snapshot.is_refreshing
  }

  pub fn is_stale(&self) -> bool {
    self.shared.lock().snapshot.is_stale
  }

  pub fn is_fallback(&self) -> bool {
    self.shared.lock().snapshot.is_fallback
  }

  pub fn error(&self) -> Option<ClassifiedError> {
    self.shared.lock().snapshot.error.clone()
  }

  /// Whether the entry this subscription shows has outlived its TTL.
  ///
  /// Unlike `is_stale`, this looks at the store, so it turns true on its own
  /// as time passes.
  pub fn needs_refresh(&self) -> bool {
    match self.client.store().timestamp(&self.key()) {
      Some(timestamp) => !is_fresh_at(timestamp, self.settings.ttl, Instant::now()),
      None => true,
    }
  }

  /// Start a refetch without waiting for it, cancelling any pending fetch.
  pub fn refetch(&self) {
    let _ = self.start_fetch();
  }

  /// Refetch without reseeding from cache; resolves once the fetch settles.
  pub async fn refresh(&self) {
    let done = self.start_fetch();
    let _ = done.await;
  }

  /// Drop the cache entry, show initial data again and re-run activation.
  ///
  /// Resolves once the resulting fetch settles (immediately if activation
  /// does not fetch).
  pub async fn invalidate(&self) {
    let key = self.key();
    self.cancel();
    self.client.store().delete(&key);
    {
      let mut shared = self.shared.lock();
      shared.snapshot = QuerySnapshot::initial(self.settings.initial_data.clone());
    }
    debug!(key = %key, "subscription invalidated");

    if let Some(done) = self.run_activation() {
      let _ = done.await;
    }
  }

  /// Point the subscription at another key.
  ///
  /// Any outstanding fetch for the old key is cancelled before the new key is
  /// activated.
  pub fn set_key(&mut self, key: impl Into<String>) {
    let key = key.into();
    let old = {
      let mut shared = self.shared.lock();
      if shared.key == key {
        return;
      }
      shared.generation += 1;
      std::mem::replace(&mut shared.key, key.clone())
    };

    self.client.release_observer(&old);
    self
      .client
      .register_observer(&key, self.settings.class.as_deref());
    debug!(from = %old, to = %key, "subscription key changed");
    self.run_activation();
  }

  /// Check for state changes since the last poll.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    match self.changes.has_changed() {
      Ok(true) => {
        self.changes.borrow_and_update();
        true
      }
      _ => false,
    }
  }

  /// Wait until the state changes.
  pub async fn changed(&mut self) {
    let _ = self.changes.changed().await;
  }
}

impl<T: Cacheable> Drop for Query<T> {
  fn drop(&mut self) {
    let key = {
      let mut shared = self.shared.lock();
      shared.generation += 1;
      shared.key.clone()
    };
    self.client.release_observer(&key);
  }
}

impl<T: Cacheable + std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let shared = self.shared.lock();
    f.debug_struct("Query")
      .field("key", &shared.key)
      .field("generation", &shared.generation)
      .field("snapshot", &shared.snapshot)
      .field("ttl", &self.settings.ttl)
      .finish_non_exhaustive()
  }
}

/// A single background fetch for one subscription generation.
struct FetchTask<T: Cacheable> {
  key: String,
  generation: u64,
  shared: Arc<Mutex<Shared<T>>>,
  notify: Arc<watch::Sender<u64>>,
  store: CacheStore,
  settings: Arc<Settings<T>>,
}

impl<T: Cacheable> FetchTask<T> {
  async fn run(self, done: oneshot::Sender<()>) {
    let fetcher = Arc::clone(&self.settings.fetcher);
    let retry = self.settings.retry;
    let shared = Arc::clone(&self.shared);
    let generation = self.generation;
    let current = move || shared.lock().generation == generation;
    let fetch = async move { retry.run_while(|| fetcher(), current).await };
    tokio::pin!(fetch);

    let timeout = self.settings.timeout;
    tokio::select! {
      biased;
      result = &mut fetch => {
        self.settle(result, true);
        let _ = done.send(());
        return;
      }
      _ = tokio::time::sleep(timeout) => {}
    }

    // The timer won. Report the timeout, but keep waiting: a late success
    // still commits unless this generation has been superseded.
    self.settle(Err(ClassifiedError::timeout(timeout)), true);
    let _ = done.send(());

    let late = fetch.await;
    self.settle(late, false);
  }

  fn settle(&self, result: std::result::Result<T, ClassifiedError>, report: bool) {
    match result {
      Ok(data) => self.commit(data),
      Err(error) => self.fail(error, report),
    }
  }

  fn commit(&self, data: T) {
    {
      let mut shared = self.shared.lock();
      if shared.generation != self.generation {
        debug!(key = %self.key, generation = self.generation, "discarding superseded result");
        return;
      }

      self.store.set(&self.key, data.clone());

      let snapshot = &mut shared.snapshot;
      snapshot.data = data.clone();
      snapshot.source = CacheSource::Network;
      snapshot.is_loading = false;
      snapshot.is_refreshing = false;
      snapshot.is_stale = false;
      snapshot.is_fallback = false;
      snapshot.error = None;
      snapshot.updated_at = Some(Utc::now());
    }
    self.notify.send_modify(|version| *version += 1);
    debug!(key = %self.key, generation = self.generation, "committed fetch result");

    if let Some(on_success) = &self.settings.on_success {
      on_success(&data);
    }
  }

  /// Record a failure without touching the shown data.
  ///
  /// `report` is false for a failure arriving after a timeout was already
  /// reported: the error is updated, but callbacks do not fire twice.
  fn fail(&self, error: ClassifiedError, report: bool) {
    {
      let mut shared = self.shared.lock();
      if shared.generation != self.generation {
        debug!(key = %self.key, generation = self.generation, %error, "ignoring failure of superseded fetch");
        return;
      }

      let snapshot = &mut shared.snapshot;
      snapshot.is_loading = false;
      snapshot.is_refreshing = false;
      snapshot.is_stale = true;
      snapshot.is_fallback = true;
      snapshot.error = Some(error.clone());
    }
    self.notify.send_modify(|version| *version += 1);

    if report {
      warn!(key = %self.key, %error, "fetch failed, keeping last known data");
      if let Some(on_error) = &self.settings.on_error {
        on_error(&error);
      }
    } else {
      debug!(key = %self.key, %error, "late failure after timeout");
    }
  }
}
