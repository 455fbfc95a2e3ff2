//! Metadata caching
//!
//! Resolution results for read-only requests, bounded by an LRU policy and
//! invalidated synchronously by every mutation.

mod lru;
mod resolve;

pub use lru::LruTracker;
pub use resolve::{CacheStats, ResolveCache};
