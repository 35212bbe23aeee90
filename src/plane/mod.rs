//! Plane addressing, fetching and caching.
//!
//! A [`PlaneKey`] names one 2D plane of an image, or one tile of it. The
//! [`PlaneFetcher`] turns a key into pixels through the session, and the
//! [`PlaneCache`] keeps recently used planes within a byte budget so that
//! scrubbing back and forth through a stack does not refetch.

mod cache;
mod fetcher;
mod key;

pub use cache::{CacheConfig, CacheStats, PlaneCache, DEFAULT_PLANE_CACHE_BUDGET};
pub use fetcher::{
    PlaneFetcher, RetryPolicy, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF,
};
pub use key::{PlaneKey, TileRegion};
