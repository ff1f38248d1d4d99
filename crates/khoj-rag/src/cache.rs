//! Caching: a generic LRU+TTL provider and the cached-embedding decorator.
//!
//! The LRU holds a hash map indexing into a doubly-linked list (the `lru`
//! crate's arena), guarded by one mutex that is only held for the duration of
//! the map/list operation — never across a suspension point.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::error::RagError;
use crate::provider::{Embedding, EmbeddingProvider};

/// Hit/miss accumulator, readable at any time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// String-keyed cache capability. Backends may be remote, so every operation
/// is a suspension point and failures surface as (non-fatal) errors.
#[async_trait]
pub trait CacheProvider<V: Clone + Send + Sync + 'static>: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<V>, RagError>;

    /// Insert or update. `ttl_ms` overrides the provider default; `None`
    /// falls back to it.
    async fn set(&self, key: String, value: V, ttl_ms: Option<u64>) -> Result<(), RagError>;

    async fn remove(&self, key: &str) -> Result<bool, RagError>;

    async fn clear(&self) -> Result<(), RagError>;

    async fn len(&self) -> usize;

    fn stats(&self) -> CacheStats;
}

/// Wire shape for cache backends that persist entries externally. TTL
/// defaults to five minutes when unset at the engine level.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PersistedCacheEntry<V> {
    pub key: String,
    pub value: V,
    /// Milliseconds since the Unix epoch.
    pub inserted_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Option<Duration>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .map(|ttl| now.duration_since(self.inserted_at) >= ttl)
            .unwrap_or(false)
    }
}

/// In-memory LRU with optional per-entry TTL and lazy expiration: expired
/// entries read as misses and are removed on access.
pub struct LruCacheProvider<V> {
    inner: Mutex<lru::LruCache<String, Entry<V>>>,
    default_ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> LruCacheProvider<V> {
    pub fn new(max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(lru::LruCache::new(capacity)),
            default_ttl: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_default_ttl(mut self, ttl_ms: u64) -> Self {
        self.default_ttl = Some(Duration::from_millis(ttl_ms));
        self
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> CacheProvider<V> for LruCacheProvider<V> {
    async fn get(&self, key: &str) -> Result<Option<V>, RagError> {
        let now = Instant::now();
        let value = {
            let mut cache = self.inner.lock();
            let expired = cache.peek(key).map(|e| e.is_expired(now)).unwrap_or(false);
            if expired {
                cache.pop(key);
                None
            } else {
                // `get` promotes the entry to the head of the recency list.
                cache.get(key).map(|e| e.value.clone())
            }
        };
        match value {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(v))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: String, value: V, ttl_ms: Option<u64>) -> Result<(), RagError> {
        let ttl = ttl_ms.map(Duration::from_millis).or(self.default_ttl);
        let entry = Entry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };
        // `push` updates in place when present, otherwise inserts at the head
        // and evicts the tail when over capacity.
        self.inner.lock().push(key, entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, RagError> {
        Ok(self.inner.lock().pop(key).is_some())
    }

    async fn clear(&self) -> Result<(), RagError> {
        self.inner.lock().clear();
        Ok(())
    }

    async fn len(&self) -> usize {
        self.inner.lock().len()
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Decorator: consult the cache, otherwise delegate and populate. Keyed by
/// the exact input text.
pub struct CachedEmbeddingProvider {
    delegate: Arc<dyn EmbeddingProvider>,
    cache: LruCacheProvider<Embedding>,
}

impl CachedEmbeddingProvider {
    pub fn new(delegate: Arc<dyn EmbeddingProvider>, max_size: usize) -> Self {
        Self {
            delegate,
            cache: LruCacheProvider::new(max_size),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Embedding, RagError> {
        if let Some(hit) = self.cache.get(text).await? {
            return Ok(hit);
        }
        let embedding = self.delegate.embed(text).await?;
        self.cache.set(text.to_string(), embedding.clone(), None).await?;
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, RagError> {
        let mut out: Vec<Option<Embedding>> = Vec::with_capacity(texts.len());
        let mut missing: Vec<(usize, String)> = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            match self.cache.get(text).await? {
                Some(hit) => out.push(Some(hit)),
                None => {
                    out.push(None);
                    missing.push((i, text.clone()));
                }
            }
        }

        if !missing.is_empty() {
            let texts_to_embed: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
            let embedded = self.delegate.embed_batch(&texts_to_embed).await?;
            for ((index, text), embedding) in missing.into_iter().zip(embedded) {
                self.cache.set(text, embedding.clone(), None).await?;
                out[index] = Some(embedding);
            }
        }

        Ok(out.into_iter().flatten().collect())
    }

    fn dimensions(&self) -> usize {
        self.delegate.dimensions()
    }

    fn max_batch_size(&self) -> usize {
        self.delegate.max_batch_size()
    }

    async fn is_available(&self) -> bool {
        self.delegate.is_available().await
    }
}
