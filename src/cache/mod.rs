//! # Cache Module
//!
//! Metadata caching in front of the media resolver.
//!
//! Song requests often repeat (the autoplaylist cycles through the same
//! URLs, users queue the same hits), and every uncached lookup spawns a
//! yt-dlp process. [`CachedResolver`] keeps lookup results for a while so
//! repeated requests resolve instantly.
//!
//! Only metadata lookups are cached. Downloads always reach the inner
//! resolver since they produce files on disk that may have been cleaned up,
//! and failed lookups are never stored.
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use guild_jukebox::cache::CachedResolver;
//! use guild_jukebox::sources::YtDlpResolver;
//! use std::time::Duration;
//!
//! # fn example() {
//! let resolver = CachedResolver::new(YtDlpResolver::new("yt-dlp", "audio_cache"))
//!     .with_ttl(Duration::from_secs(3600));
//! # }
//! ```

pub mod lru_cache;

use async_trait::async_trait;
use lru_cache::LRUCache;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    error::ResolutionError,
    sources::{MediaResolver, ResolveOptions, ResolvedMedia},
};

/// Cached resolver results, keyed by the normalized request.
pub type MetadataCache = LRUCache<String, ResolvedMedia>;

const DEFAULT_CAPACITY: usize = 500;
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// [`MediaResolver`] that remembers successful lookups.
pub struct CachedResolver<R> {
    inner: R,
    cache: MetadataCache,
}

impl<R: MediaResolver> CachedResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: LRUCache::new(DEFAULT_CAPACITY).with_ttl(DEFAULT_TTL),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache = LRUCache::new(self.cache.capacity()).with_ttl(ttl);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.cache = LRUCache::new(capacity).with_ttl(DEFAULT_TTL);
        self
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Performs cache maintenance by removing expired entries.
    pub fn cleanup_old_entries(&self) {
        let removed = self.cache.cleanup_expired();
        if removed > 0 {
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
        }
    }
}

#[async_trait]
impl<R: MediaResolver> MediaResolver for CachedResolver<R> {
    async fn resolve(
        &self,
        spec: &str,
        options: ResolveOptions,
    ) -> Result<ResolvedMedia, ResolutionError> {
        if options.download {
            return self.inner.resolve(spec, options).await;
        }

        let key = spec.to_string();
        if let Some(cached) = self.cache.get(&key) {
            debug!("💾 Cache hit: {}", spec);
            return Ok(cached);
        }

        let resolved = self.inner.resolve(spec, options).await?;
        self.cache.insert(key, resolved.clone());
        Ok(resolved)
    }
}
