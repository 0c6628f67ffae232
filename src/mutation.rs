//! Write operations with retry and cache follow-up.
//!
//! A mutation is imperative: unlike a query, its error is returned to the
//! caller. On success the listed keys are invalidated and `on_success` gets a
//! chance to write optimistic data through the client.

use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::Cacheable;
use crate::client::QueryClient;
use crate::error::ClassifiedError;
use crate::query::ErrorCallback;
use crate::retry::RetryPolicy;

type MutateFn<I, T> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type MutationSuccess<T> = Arc<dyn Fn(&T, &QueryClient) + Send + Sync>;

pub struct MutationOptions<I, T> {
  mutate_fn: MutateFn<I, T>,
  retry: Option<RetryPolicy>,
  invalidates: Vec<String>,
  on_success: Option<MutationSuccess<T>>,
  on_error: Option<ErrorCallback>,
}

impl<I: Send + 'static, T: Cacheable> MutationOptions<I, T> {
  pub fn new<F, Fut>(mutate_fn: F) -> Self
  where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    Self {
      mutate_fn: Arc::new(move |input: I| mutate_fn(input).boxed()),
      retry: None,
      invalidates: Vec::new(),
      on_success: None,
      on_error: None,
    }
  }

  pub fn retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = Some(retry);
    self
  }

  /// Cache key to drop after a successful mutation.
  pub fn invalidates(mut self, key: impl Into<String>) -> Self {
    self.invalidates.push(key.into());
    self
  }

  /// Runs after invalidation; use the client for optimistic `set_data`.
  pub fn on_success<F>(mut self, callback: F) -> Self
  where
    F: Fn(&T, &QueryClient) + Send + Sync + 'static,
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

#[derive(Debug, Clone, PartialEq)]
pub struct MutationState<T> {
  pub is_pending: bool,
  pub data: Option<T>,
  pub error: Option<ClassifiedError>,
}

impl<T> Default for MutationState<T> {
  fn default() -> Self {
    Self {
      is_pending: false,
      data: None,
      error: None,
    }
  }
}

pub struct Mutation<I, T> {
  client: QueryClient,
  options: Arc<MutationOptions<I, T>>,
  state: Arc<Mutex<MutationState<T>>>,
}

impl<I, T> Mutation<I, T>
where
  I: Clone + Send + 'static,
  T: Cacheable,
{
  pub(crate) fn new(client: QueryClient, options: MutationOptions<I, T>) -> Self {
    Self {
      client,
      options: Arc::new(options),
      state: Arc::new(Mutex::new(MutationState::default())),
    }
  }

  pub fn state(&self) -> MutationState<T> {
    self.state.lock().clone()
  }

  pub fn is_pending(&self) -> bool {
    self.state.lock().is_pending
  }

  /// Run the mutation, retrying per the mutation policy (one retry by
  /// default).
  pub async fn mutate(&self, input: I) -> std::result::Result<T, ClassifiedError> {
    {
      let mut state = self.state.lock();
      state.is_pending = true;
      state.error = None;
    }

    let retry = self
      .options
      .retry
      .unwrap_or(self.client.defaults().mutation_retry);
    let mutate_fn = Arc::clone(&self.options.mutate_fn);
    let result = retry.run(|| mutate_fn(input.clone())).await;

    match result {
      Ok(data) => {
        {
          let mut state = self.state.lock();
          state.is_pending = false;
          state.data = Some(data.clone());
        }
        for key in &self.options.invalidates {
          self.client.invalidate(key);
        }
        debug!(invalidated = self.options.invalidates.len(), "mutation succeeded");
        if let Some(on_success) = &self.options.on_success {
          on_success(&data, &self.client);
        }
        Ok(data)
      }
      Err(error) => {
        {
          let mut state = self.state.lock();
          state.is_pending = false;
          state.error = Some(error.clone());
        }
        warn!(%error, "mutation failed");
        if let Some(on_error) = &self.options.on_error {
          on_error(&error);
        }
        Err(error)
      }
    }
  }
}
