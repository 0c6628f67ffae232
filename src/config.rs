use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{ClassConfig, StalenessPolicy};
use crate::client::ClientDefaults;
use crate::retry::{RetryPolicy, MUTATION_RETRIES, QUERY_RETRIES};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub fetch: FetchConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  /// Staleness class overrides, keyed by class name (case-insensitive)
  #[serde(default, deserialize_with = "deserialize_lowercase_keys")]
  pub staleness: HashMap<String, ClassConfig>,
}

fn deserialize_lowercase_keys<'de, D>(
  deserializer: D,
) -> Result<HashMap<String, ClassConfig>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let m: HashMap<String, ClassConfig> = HashMap::deserialize(deserializer)?;
  Ok(m.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
  /// Race timeout for a subscription's fetch
  pub timeout_ms: u64,
  /// Race timeout for prefetches
  pub prefetch_timeout_ms: u64,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      timeout_ms: 3_000,
      prefetch_timeout_ms: 3_000,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub query_retries: u32,
  pub mutation_retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      query_retries: QUERY_RETRIES,
      mutation_retries: MUTATION_RETRIES,
      base_delay_ms: 1_000,
      max_delay_ms: 8_000,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./revalidate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/revalidate/config.yaml
  ///
  /// Without any file the built-in defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = match explicit_path {
      Some(p) if !p.exists() => return Err(eyre!("Config file not found: {}", p.display())),
      Some(p) => Some(p.to_path_buf()),
      None => Self::candidates().into_iter().find(|p| p.exists()),
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  /// Implicit config locations, highest priority first.
  fn candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("revalidate.yaml")];
    paths.extend(dirs::config_dir().map(|dir| dir.join("revalidate").join("config.yaml")));
    paths
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.retry.max_delay_ms < self.retry.base_delay_ms {
      return Err(eyre!(
        "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
        self.retry.max_delay_ms,
        self.retry.base_delay_ms
      ));
    }
    for (name, class) in &self.staleness {
      if class.gc_ms < class.ttl_ms {
        return Err(eyre!(
          "staleness class '{}': gc_ms ({}) is below ttl_ms ({})",
          name,
          class.gc_ms,
          class.ttl_ms
        ));
      }
    }
    Ok(())
  }

  pub fn staleness_policy(&self) -> StalenessPolicy {
    StalenessPolicy::with_overrides(&self.staleness)
  }

  pub fn client_defaults(&self) -> ClientDefaults {
    let base = Duration::from_millis(self.retry.base_delay_ms);
    let max = Duration::from_millis(self.retry.max_delay_ms);
    ClientDefaults {
      fetch_timeout: Duration::from_millis(self.fetch.timeout_ms),
      prefetch_timeout: Duration::from_millis(self.fetch.prefetch_timeout_ms),
      query_retry: RetryPolicy::with_retries(self.retry.query_retries).with_delays(base, max),
      mutation_retry: RetryPolicy::with_retries(self.retry.mutation_retries).with_delays(base, max),
    }
  }
}
