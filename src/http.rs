//! Minimal HTTP source used by the CLI to feed real responses through the
//! cache.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::error::HttpStatusError;

/// Longest response body excerpt kept in an error message.
const ERROR_BODY_LIMIT: usize = 200;

/// JSON-over-HTTP client wrapper
#[derive(Clone)]
pub struct HttpSource {
  client: reqwest::Client,
}

impl HttpSource {
  /// `request_timeout` bounds the whole request at the transport level. It
  /// should exceed the engine's race timeout so late responses can still be
  /// cached.
  pub fn new(request_timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(request_timeout)
      .user_agent(concat!("revalidate/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// GET `url` and parse the body as JSON.
  ///
  /// Non-success statuses become [`HttpStatusError`] so the retry policy can
  /// tell client errors from server errors. Transport errors are passed on
  /// as `reqwest::Error`.
  pub async fn get_json(&self, url: &Url) -> Result<Value> {
    let response = self.client.get(url.clone()).send().await?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(HttpStatusError::new(status.as_u16(), excerpt(&body)).into());
    }

    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| eyre!("Invalid JSON from {}: {}", url, e))
  }
}

fn excerpt(body: &str) -> String {
  let trimmed = body.trim();
  match trimmed.char_indices().nth(ERROR_BODY_LIMIT) {
    Some((idx, _)) => format!("{}...", &trimmed[..idx]),
    None => trimmed.to_string(),
  }
}

/// One-line description of a JSON document for terminal output.
pub fn describe(value: &Value) -> String {
  match value {
    Value::Array(items) => format!("array of {} items", items.len()),
    Value::Object(map) => format!("object with {} keys", map.len()),
    Value::String(s) => format!("string ({} chars)", s.chars().count()),
    Value::Null => "null".to_string(),
    other => other.to_string(),
  }
}
