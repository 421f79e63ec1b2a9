//! Public Key Caching
//!
//! Caches fetched remote public keys to reduce remote requests.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::AppError;

use super::fetch::RemoteFetcher;
use super::signature::{RemoteKey, fetch_public_key};

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    key: RemoteKey,
    cached_at: Instant,
}

/// Where a key returned by [`PublicKeyCache::get`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Cache,
    Network,
}

/// Public key cache
///
/// Thread-safe cache for remote actor public keys, keyed by key id.
pub struct PublicKeyCache {
    cache: RwLock<HashMap<String, CachedKey>>,
    fetcher: RemoteFetcher,
    ttl: Duration,
}

impl PublicKeyCache {
    pub fn new(fetcher: RemoteFetcher, ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            fetcher,
            ttl,
        }
    }

    fn is_valid(&self, entry: &CachedKey) -> bool {
        entry.cached_at.elapsed() < self.ttl
    }

    /// Get public key for a key ID
    ///
    /// Checks cache first, fetches from remote if not cached or expired.
    pub async fn get(&self, key_id: &str) -> Result<(RemoteKey, KeySource), AppError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(key_id) {
                if self.is_valid(cached) {
                    tracing::debug!(key_id, "Public key cache hit");
                    return Ok((cached.key.clone(), KeySource::Cache));
                }
                tracing::debug!(key_id, "Public key cache expired");
            }
        }

        let key = self.refresh(key_id).await?;
        Ok((key, KeySource::Network))
    }

    /// Fetch a key and resolve its owner, replacing any cached copy
    pub async fn refresh(&self, key_id: &str) -> Result<RemoteKey, AppError> {
        tracing::debug!(key_id, "Fetching public key");
        let key = fetch_public_key(&self.fetcher, key_id).await?;

        self.cache.write().await.insert(
            key_id.to_string(),
            CachedKey {
                key: key.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(key)
    }

    /// Invalidate a cached key
    pub async fn invalidate(&self, key_id: &str) {
        self.cache.write().await.remove(key_id);
        tracing::debug!(key_id, "Invalidated public key cache entry");
    }

    /// Prune expired entries
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        let ttl = self.ttl;
        cache.retain(|_, v| v.cached_at.elapsed() < ttl);
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!("Pruned {} expired public key cache entries", removed);
        }
    }

    #[cfg(test)]
    async fn insert(&self, key_id: &str, key: RemoteKey) {
        self.cache.write().await.insert(
            key_id.to_string(),
            CachedKey {
                key,
                cached_at: Instant::now(),
            },
        );
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.cache.read().await.len()
    }
}
