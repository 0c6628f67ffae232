//! In-memory caching primitives.
//!
//! This module provides the storage side of the engine:
//! - `CacheStore`: key to `{ data, timestamp }` map, shared by handle
//! - `StalenessPolicy`: named TTL / GC classes and the freshness check
//! - `Cacheable`, `CacheEntry`, `CacheSource`: the types passed around

mod policy;
mod store;
mod traits;

pub use policy::{is_fresh_at, ClassConfig, StalenessClass, StalenessPolicy, DEFAULT_CLASS};
pub use store::CacheStore;
pub use traits::{CacheEntry, CacheSource, Cacheable};
