//! Retry with capped exponential backoff, shared by queries and mutations.

use color_eyre::Result;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::{classify, ClassifiedError};

/// Retries for a read.
pub const QUERY_RETRIES: u32 = 3;
/// Retries for a write.
pub const MUTATION_RETRIES: u32 = 1;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(8_000);

/// Decides whether and when a failed operation runs again.
///
/// Client errors (4xx) are never retried. Anything else is retried up to
/// `max_retries` times, waiting `min(base * 2^attempt, max)` before each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::query()
  }
}

impl RetryPolicy {
  pub fn query() -> Self {
    Self::with_retries(QUERY_RETRIES)
  }

  pub fn mutation() -> Self {
    Self::with_retries(MUTATION_RETRIES)
  }

  /// Single attempt.
  pub fn none() -> Self {
    Self::with_retries(0)
  }

  pub fn with_retries(max_retries: u32) -> Self {
    Self {
      max_retries,
      base_delay: DEFAULT_BASE_DELAY,
      max_delay: DEFAULT_MAX_DELAY,
    }
  }

  pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
    self.base_delay = base_delay;
    self.max_delay = max_delay;
    self
  }

  /// Delay before retry number `attempt` (0-based).
  pub fn delay(&self, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    self
      .base_delay
      .checked_mul(factor)
      .map_or(self.max_delay, |d| d.min(self.max_delay))
  }

  /// Whether `error` may be retried after `attempt` retries have been used.
  pub fn should_retry(&self, error: &ClassifiedError, attempt: u32) -> bool {
    error.is_retryable() && attempt < self.max_retries
  }

  /// Run `op` until it succeeds, fails terminally, or runs out of retries.
  ///
  /// Attempts are sequential; the returned error is the last one seen.
  pub async fn run<T, F, Fut>(&self, op: F) -> std::result::Result<T, ClassifiedError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self.run_while(op, || true).await
  }

  /// Like [`run`](Self::run), but stops retrying once `active` returns false.
  ///
  /// `active` is checked after every backoff sleep, before the next attempt.
  /// An abandoned run returns the last error it saw.
  pub async fn run_while<T, F, Fut, A>(
    &self,
    mut op: F,
    active: A,
  ) -> std::result::Result<T, ClassifiedError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    A: Fn() -> bool,
  {
    let mut attempt = 0;
    loop {
      let error = match op().await {
        Ok(value) => return Ok(value),
        Err(report) => classify(&report),
      };

      if !self.should_retry(&error, attempt) {
        debug!(attempts = attempt + 1, %error, "giving up");
        return Err(error);
      }

      let delay = self.delay(attempt);
      debug!(
        attempt = attempt + 1,
        delay_ms = delay.as_millis() as u64,
        %error,
        "retrying after failure"
      );
      tokio::time::sleep(delay).await;
      attempt += 1;

      if !active() {
        debug!(attempts = attempt, %error, "abandoning retries");
        return Err(error);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{ErrorKind, HttpStatusError};
  use color_eyre::eyre::{eyre, Report};
  use parking_lot::Mutex;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use tokio::time::Instant;

  #[test]
  fn test_backoff_schedule() {
    let policy = RetryPolicy::query();
    assert_eq!(policy.delay(0), Duration::from_millis(1_000));
    assert_eq!(policy.delay(1), Duration::from_millis(2_000));
    assert_eq!(policy.delay(2), Duration::from_millis(4_000));
    assert_eq!(policy.delay(3), Duration::from_millis(8_000));
    assert_eq!(policy.delay(4), Duration::from_millis(8_000));
    assert_eq!(policy.delay(40), Duration::from_millis(8_000));
  }

  #[test]
  fn test_ceilings() {
    let server = ClassifiedError::from_status(500, "x");
    let client = ClassifiedError::from_status(404, "x");

    let query = RetryPolicy::query();
    assert!(query.should_retry(&server, 0));
    assert!(query.should_retry(&server, 2));
    assert!(!query.should_retry(&server, 3));
    assert!(!query.should_retry(&client, 0));

    let mutation = RetryPolicy::mutation();
    assert!(mutation.should_retry(&server, 0));
    assert!(!mutation.should_retry(&server, 1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_client_error_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result: std::result::Result<(), _> = RetryPolicy::query()
      .run(|| {
        let counter = counter.clone();
        async move {
          counter.fetch_add(1, Ordering::SeqCst);
          Err(Report::new(HttpStatusError::new(404, "missing")))
        }
      })
      .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.unwrap_err().kind, ErrorKind::Client);
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_error_retried_with_backoff() {
    let calls: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = calls.clone();

    let result: std::result::Result<(), _> = RetryPolicy::query()
      .run(|| {
        let recorder = recorder.clone();
        async move {
          recorder.lock().push(Instant::now());
          Err(Report::new(HttpStatusError::new(500, "boom")))
        }
      })
      .await;

    assert_eq!(result.unwrap_err().status, Some(500));
    let calls = calls.lock();
    assert_eq!(calls.len(), 4);
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
      gaps,
      vec![
        Duration::from_millis(1_000),
        Duration::from_millis(2_000),
        Duration::from_millis(4_000),
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_recovers_after_transient_failure() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = RetryPolicy::mutation()
      .run(|| {
        let counter = counter.clone();
        async move {
          if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(eyre!("connection refused"))
          } else {
            Ok("saved")
          }
        }
      })
      .await;

    assert_eq!(result, Ok("saved"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_none_runs_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result: std::result::Result<u8, _> = RetryPolicy::none()
      .run(|| {
        let counter = counter.clone();
        async move {
          counter.fetch_add(1, Ordering::SeqCst);
          Err(eyre!("offline"))
        }
      })
      .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_run_while_stops_when_inactive() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let checked = calls.clone();

    // Inactive as soon as the first attempt has been made.
    let result: std::result::Result<u8, _> = RetryPolicy::query()
      .run_while(
        || {
          let counter = counter.clone();
          async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Report::new(HttpStatusError::new(503, "unavailable")))
          }
        },
        || checked.load(Ordering::SeqCst) < 1,
      )
      .await;

    assert_eq!(result.unwrap_err().status, Some(503));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
