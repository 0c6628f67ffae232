//! Error classification for fetch and mutation failures.
//!
//! Fetchers return plain `color_eyre::Result`s. Before the retry policy or a
//! subscription looks at a failure it is turned into a [`ClassifiedError`],
//! so nothing downstream needs to know what the fetcher actually threw.

use color_eyre::eyre::Report;
use std::time::Duration;
use thiserror::Error;

/// Broad failure category used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  /// 4xx - the request itself is wrong, retrying cannot help
  Client,
  /// 5xx
  Server,
  /// No status available: connectivity failure or an untyped error
  Network,
  /// Raised by the engine when a fetch loses the race against its timer
  Timeout,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::Client => "client",
      ErrorKind::Server => "server",
      ErrorKind::Network => "network",
      ErrorKind::Timeout => "timeout",
    }
  }
}

/// A failure after classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} error{}: {message}", .kind.as_str(), .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
pub struct ClassifiedError {
  pub kind: ErrorKind,
  pub status: Option<u16>,
  pub message: String,
}

impl ClassifiedError {
  pub fn new(kind: ErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
    Self {
      kind,
      status,
      message: message.into(),
    }
  }

  /// Build from an HTTP-style status code.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let kind = if (400..500).contains(&status) {
      ErrorKind::Client
    } else if status >= 500 {
      ErrorKind::Server
    } else {
      ErrorKind::Network
    };
    Self::new(kind, Some(status), message)
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Network, None, message)
  }

  pub fn timeout(after: Duration) -> Self {
    Self::new(
      ErrorKind::Timeout,
      None,
      format!("no response within {}ms", after.as_millis()),
    )
  }

  /// Client errors are terminal; everything else may be retried.
  pub fn is_retryable(&self) -> bool {
    self.kind != ErrorKind::Client
  }
}

/// Status-carrying error for fetchers that talk to something HTTP-like.
///
/// Returning this (wrapped in an eyre `Report`) is how a fetcher tells the
/// engine the status of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("HTTP {status}: {message}")]
pub struct HttpStatusError {
  pub status: u16,
  pub message: String,
}

impl HttpStatusError {
  pub fn new(status: u16, message: impl Into<String>) -> Self {
    Self {
      status,
      message: message.into(),
    }
  }
}

/// Turn an arbitrary fetcher error into a [`ClassifiedError`].
///
/// Recognises (in order) an already classified error, [`HttpStatusError`] and
/// `reqwest::Error`. Anything else is treated as a network failure.
pub fn classify(report: &Report) -> ClassifiedError {
  if let Some(classified) = report.downcast_ref::<ClassifiedError>() {
    return classified.clone();
  }

  if let Some(http) = report.downcast_ref::<HttpStatusError>() {
    return ClassifiedError::from_status(http.status, http.message.clone());
  }

  if let Some(err) = report.downcast_ref::<reqwest::Error>() {
    if let Some(status) = err.status() {
      return ClassifiedError::from_status(status.as_u16(), err.to_string());
    }
    if err.is_timeout() {
      return ClassifiedError::new(ErrorKind::Timeout, None, err.to_string());
    }
    return ClassifiedError::network(err.to_string());
  }

  ClassifiedError::network(format!("{:#}", report))
}
