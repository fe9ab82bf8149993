//! # Cache Module
//!
//! Short-lived caching of track lookups.
//!
//! Resolving a query costs a REST round trip to a node, and the same
//! searches repeat a lot (popular songs, the autoqueue asking for the same
//! mix). Results are kept for `search_cache_ttl_secs` and evicted oldest
//! first once the cache is full.

pub mod ttl_cache;

pub use ttl_cache::{CacheMetrics, TtlCache};

use tracing::info;

use crate::audio::track::Track;

/// Resolved tracks keyed by the identifier sent to the node
/// (`ytsearch:...` or a URL).
pub type SearchCache = TtlCache<String, Vec<Track>>;

impl SearchCache {
    /// Performs cache maintenance by removing expired entries.
    ///
    /// Called periodically from the maintenance task.
    pub fn cleanup_old_entries(&self) {
        let removed = self.cleanup_expired();
        if removed > 0 {
            let metrics = self.metrics();
            info!(
                "🧹 Cache cleanup: removed {} expired entries (hit rate {:.0}%)",
                removed,
                metrics.hit_rate() * 100.0
            );
        }
    }
}
