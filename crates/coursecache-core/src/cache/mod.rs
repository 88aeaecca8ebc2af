//! Response caching layer.
//!
//! This module caches web service responses per site so screens can render
//! without a round trip and keep working offline.
//!
//! Entries are filed under hierarchical keys (`root:subresource:id`) plus a
//! variant, usually a hash of the call parameters. Invalidation works on exact
//! keys or key prefixes, and follows registered dependencies between keys.

pub mod manager;
pub mod store;

pub use manager::{entry_id, CachedEntry, ReadOptions, ResponseCache, UpdateFrequency, ID_SEPARATOR};
pub use store::{CacheStore, JsonCacheStore};
