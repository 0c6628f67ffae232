//! Named staleness classes.
//!
//! A class pairs a TTL (how long a written entry counts as fresh) with a GC
//! horizon (how long an entry nobody observes may stay in the store). The
//! table is configuration: picking the wrong class for a key is a silent
//! correctness bug, so keys should name their class explicitly.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::traits::CacheEntry;

/// Name of the fallback class used when none (or an unknown one) is given.
pub const DEFAULT_CLASS: &str = "default";

const SECOND: u64 = 1_000;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;

/// Built-in classes as `(name, ttl_ms, gc_ms)`, ordered by increasing
/// staleness tolerance.
const BUILTIN_CLASSES: &[(&str, u64, u64)] = &[
  ("realtime", 0, MINUTE),
  ("tickets", 30 * SECOND, 5 * MINUTE),
  ("alerts", 30 * SECOND, 5 * MINUTE),
  ("analytics", 60 * SECOND, 5 * MINUTE),
  (DEFAULT_CLASS, 60 * SECOND, 5 * MINUTE),
  ("projects", 2 * MINUTE, 10 * MINUTE),
  ("activities", 2 * MINUTE, 10 * MINUTE),
  ("articles", 5 * MINUTE, 30 * MINUTE),
  ("users", 5 * MINUTE, 30 * MINUTE),
  ("roles", 5 * MINUTE, 30 * MINUTE),
  ("categories", 10 * MINUTE, HOUR),
  ("permissions", 10 * MINUTE, HOUR),
  ("workflows", 10 * MINUTE, HOUR),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessClass {
  pub name: String,
  pub ttl: Duration,
  pub gc: Duration,
}

impl StalenessClass {
  pub fn new(name: impl Into<String>, ttl: Duration, gc: Duration) -> Self {
    Self {
      name: name.into(),
      ttl,
      gc,
    }
  }
}

/// Class definition as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ClassConfig {
  pub ttl_ms: u64,
  pub gc_ms: u64,
}

/// Immutable lookup table of staleness classes.
#[derive(Debug, Clone)]
pub struct StalenessPolicy {
  classes: Arc<HashMap<String, StalenessClass>>,
}

impl Default for StalenessPolicy {
  fn default() -> Self {
    Self::with_overrides(&HashMap::new())
  }
}

impl StalenessPolicy {
  /// Built-in table with `overrides` replacing or adding classes by name.
  pub fn with_overrides(overrides: &HashMap<String, ClassConfig>) -> Self {
    let mut classes: HashMap<String, StalenessClass> = BUILTIN_CLASSES
      .iter()
      .map(|(name, ttl, gc)| {
        (
          name.to_string(),
          StalenessClass::new(*name, Duration::from_millis(*ttl), Duration::from_millis(*gc)),
        )
      })
      .collect();

    for (name, cfg) in overrides {
      let name = name.to_lowercase();
      classes.insert(
        name.clone(),
        StalenessClass::new(
          name,
          Duration::from_millis(cfg.ttl_ms),
          Duration::from_millis(cfg.gc_ms),
        ),
      );
    }

    Self {
      classes: Arc::new(classes),
    }
  }

  /// Look up a class, falling back to the default class.
  pub fn class(&self, name: Option<&str>) -> &StalenessClass {
    name
      .and_then(|n| self.classes.get(&n.to_lowercase()))
      .unwrap_or_else(|| self.default_class())
  }

  pub fn default_class(&self) -> &StalenessClass {
    // The default class is always present: it is in the builtin table and
    // overrides can only replace it.
    &self.classes[DEFAULT_CLASS]
  }

  /// Whether a class with this name is configured.
  pub fn contains(&self, name: &str) -> bool {
    self.classes.contains_key(&name.to_lowercase())
  }

  /// Class names sorted by TTL, then name.
  pub fn names(&self) -> Vec<&str> {
    let mut classes: Vec<&StalenessClass> = self.classes.values().collect();
    classes.sort_by(|a, b| a.ttl.cmp(&b.ttl).then_with(|| a.name.cmp(&b.name)));
    classes.into_iter().map(|c| c.name.as_str()).collect()
  }

  /// `now - entry.timestamp < class.ttl`
  pub fn is_fresh<T>(&self, entry: &CacheEntry<T>, class: &StalenessClass) -> bool {
    is_fresh_at(entry.timestamp, class.ttl, Instant::now())
  }
}

/// Freshness check against an explicit TTL and clock reading.
pub fn is_fresh_at(timestamp: Instant, ttl: Duration, now: Instant) -> bool {
  now.saturating_duration_since(timestamp) < ttl
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_builtin_lookup() {
    let policy = StalenessPolicy::default();
    assert_eq!(policy.class(Some("realtime")).ttl, Duration::ZERO);
    assert_eq!(policy.class(Some("tickets")).ttl, Duration::from_secs(30));
    assert_eq!(policy.class(Some("projects")).ttl, Duration::from_secs(120));
    assert_eq!(policy.class(Some("articles")).ttl, Duration::from_secs(300));
    assert_eq!(policy.class(Some("workflows")).ttl, Duration::from_secs(600));
  }

  #[test]
  fn test_unknown_falls_back_to_default() {
    let policy = StalenessPolicy::default();
    assert_eq!(policy.class(None).name, DEFAULT_CLASS);
    assert_eq!(policy.class(Some("nope")).name, DEFAULT_CLASS);
    assert_eq!(policy.class(None).ttl, Duration::from_secs(60));
  }

  #[test]
  fn test_lookup_is_case_insensitive() {
    let policy = StalenessPolicy::default();
    assert_eq!(policy.class(Some("Tickets")).name, "tickets");
  }

  #[test]
  fn test_builtin_ordering() {
    let policy = StalenessPolicy::default();
    let ttl = |name| policy.class(Some(name)).ttl;
    assert!(ttl("realtime") < ttl("tickets"));
    assert_eq!(ttl("tickets"), ttl("alerts"));
    assert!(ttl("alerts") < ttl("analytics"));
    assert!(ttl("analytics") < ttl("projects"));
    assert!(ttl("activities") < ttl("articles"));
    assert!(ttl("roles") < ttl("categories"));
    assert_eq!(policy.names().first(), Some(&"realtime"));
  }

  #[test]
  fn test_overrides() {
    let mut overrides = HashMap::new();
    overrides.insert(
      "Tickets".to_string(),
      ClassConfig {
        ttl_ms: 5_000,
        gc_ms: 10_000,
      },
    );
    overrides.insert(
      "invoices".to_string(),
      ClassConfig {
        ttl_ms: 45_000,
        gc_ms: 90_000,
      },
    );
    let policy = StalenessPolicy::with_overrides(&overrides);
    assert_eq!(policy.class(Some("tickets")).ttl, Duration::from_secs(5));
    assert!(policy.contains("invoices"));
    assert_eq!(policy.class(Some("invoices")).gc, Duration::from_secs(90));
  }

  #[tokio::test(start_paused = true)]
  async fn test_entry_freshness_by_class() {
    let store = crate::cache::CacheStore::new();
    let policy = StalenessPolicy::default();
    store.set("dashboard-tickets", vec![1u8]);
    let entry = store.get::<Vec<u8>>("dashboard-tickets").unwrap();

    assert!(policy.is_fresh(&entry, policy.class(Some("tickets"))));
    assert!(!policy.is_fresh(&entry, policy.class(Some("realtime"))));

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(!policy.is_fresh(&entry, policy.class(Some("tickets"))));
    assert!(policy.is_fresh(&entry, policy.class(Some("projects"))));
  }

  #[tokio::test(start_paused = true)]
  async fn test_freshness_boundary() {
    let start = Instant::now();
    let ttl = Duration::from_millis(100);
    assert!(is_fresh_at(start, ttl, start));
    assert!(is_fresh_at(start, ttl, start + Duration::from_millis(99)));
    assert!(!is_fresh_at(start, ttl, start + Duration::from_millis(100)));
    assert!(!is_fresh_at(start, Duration::ZERO, start));
  }
}
