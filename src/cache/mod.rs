//! # Cache Module
//!
//! Caching of search results returned by the audio nodes.
//!
//! Every `/loadtracks` call costs a REST round trip and counts against the
//! node's load score, so identical queries inside the TTL window are answered
//! from memory instead.
//!
//! ## Configuration
//!
//! ```env
//! SEARCH_CACHE_SIZE=500       # Maximum number of cached queries
//! SEARCH_CACHE_TTL=600        # Time-to-live in seconds
//! ```

pub mod lru_cache;

use lru_cache::LRUCache;
use std::time::Duration;
use tracing::info;

use crate::sources::SearchResult;

/// Search results keyed by the normalized query text.
pub type SearchCache = LRUCache<String, Vec<SearchResult>>;

impl SearchCache {
    pub fn for_search(capacity: usize, ttl: Duration) -> Self {
        Self::with_ttl(capacity, Some(ttl))
    }

    /// Removes expired entries. Called periodically from a background task.
    pub fn cleanup_old_entries(&self) {
        let removed = self.cleanup_expired();
        if removed > 0 {
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
        }
    }
}

/// Normalizes a query so that casing and surrounding whitespace share an entry.
pub fn cache_key(query: &str) -> String {
    query.trim().to_lowercase()
}
