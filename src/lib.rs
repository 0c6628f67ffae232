//! Stale-while-revalidate query cache.
//!
//! A [`QueryClient`] owns a [`CacheStore`] and hands out subscriptions
//! ([`Query`]) that always have renderable data and refresh it in the
//! background, plus [`Mutation`]s for writes. Failures never blank data that
//! is already shown; they surface as `error` / `is_fallback` on the snapshot.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod mutation;
pub mod query;
pub mod retry;

pub use cache::{CacheEntry, CacheSource, CacheStore, Cacheable, StalenessClass, StalenessPolicy};
pub use client::{ClientDefaults, QueryClient};
pub use config::Config;
pub use error::{classify, ClassifiedError, ErrorKind, HttpStatusError};
pub use mutation::{Mutation, MutationOptions, MutationState};
pub use query::{Query, QueryOptions, QuerySnapshot};
pub use retry::RetryPolicy;
