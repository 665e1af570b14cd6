//! Client-side collection cache for point-of-sale apps: stale-while-revalidate
//! reads, request coalescing, durable persistence, retry with backoff and
//! cache warming.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod datastore;
pub mod errlog;
pub mod error;
pub mod event;
pub mod models;
pub mod network;
pub mod preload;
pub mod query;
pub mod retry;
pub mod source;

pub use cache::{CacheKey, Cacheable, FetchOptions, SmartCache};
pub use error::{FetchError, StoreError};
pub use event::{CacheEvent, EventBus};
