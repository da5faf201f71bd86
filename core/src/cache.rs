//! C2 — Embedding Cache: a time-bounded, bounded-size mapping from normalized query text to its
//! embedding vector.
//!
//! Eviction approximates LRU by oldest-insertion timestamp rather than maintaining a full
//! recency-ordered list — the codebase this draws its shape from (`cursor-kg`'s
//! `BatchProcessor::LruCache`) keeps an explicit access-order `Vec`; this cache instead relies on
//! §4.2's documented contract that ties may break arbitrarily, so a single `HashMap` scan for the
//! minimum timestamp is enough and avoids a second data structure.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

/// Anything that can turn text into a vector. Implemented by [`crate::runtime_client::RuntimeClient`]
/// in production and by an in-memory stub in tests.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

const KEY_MAX_LEN: usize = 200;

/// Normalizes `text` into the cache key: lowercase, collapse whitespace, trim, truncate.
///
/// Collisions across case/whitespace variants are intentional (§4.2): `"Context pipeline!"` and
/// `"context pipeline"` must produce the same key once exclamation is treated as whitespace-
/// adjacent punctuation is *not* stripped — only whitespace collapsing, casing and trimming are
/// part of the contract. Callers relying on punctuation-insensitivity should normalize further
/// upstream.
pub fn normalize_key(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let trimmed = collapsed.trim();
    trimmed.chars().take(KEY_MAX_LEN).collect()
}

struct Entry {
    vector: Vec<f32>,
    ts: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    hits: u64,
    misses: u64,
}

/// Process-wide singleton (§9): one [`EmbeddingCache`] handle shared by reference into the
/// [`crate::assembler::Assembler`].
pub struct EmbeddingCache {
    inner: Mutex<Inner>,
    cache_max: usize,
    ttl: Duration,
}

impl EmbeddingCache {
    pub fn new(cache_max: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            cache_max: cache_max.max(1),
            ttl,
        }
    }

    /// `getOrCompute(text) -> float[D]` (§4.2).
    ///
    /// Concurrent calls on the same key may both miss and both call the embedder; whichever
    /// write lands last wins. This is the documented open question in §9 — no singleflight.
    pub async fn get_or_compute(
        &self,
        embedder: &dyn Embedder,
        text: &str,
    ) -> Result<Vec<f32>> {
        let key = normalize_key(text);

        {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.entries.get(&key) {
                if entry.ts.elapsed() <= self.ttl {
                    inner.hits += 1;
                    return Ok(entry.vector.clone());
                }
            }
            inner.misses += 1;
        }

        let vector = embedder.embed(text).await?;

        let mut inner = self.inner.lock().await;
        self.insert_locked(&mut inner, key, vector.clone());
        Ok(vector)
    }

    fn insert_locked(&self, inner: &mut Inner, key: String, vector: Vec<f32>) {
        if inner.entries.len() >= self.cache_max && !inner.entries.contains_key(&key) {
            if let Some(oldest_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.ts)
                .map(|(k, _)| k.clone())
            {
                debug!(key = %oldest_key, "evicting oldest embedding cache entry");
                inner.entries.remove(&oldest_key);
            }
        }
        inner.entries.insert(
            key,
            Entry {
                vector,
                ts: Instant::now(),
            },
        );
    }

    /// `invalidate()` — drop all entries.
    pub async fn invalidate(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn hit_miss(&self) -> (u64, u64) {
        let inner = self.inner.lock().await;
        (inner.hits, inner.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
        dim: usize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32; self.dim])
        }
    }

    #[test]
    fn normalize_key_is_idempotent() {
        let once = normalize_key("  Context   Pipeline!  ");
        let twice = normalize_key(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_key_collapses_case_and_whitespace() {
        assert_eq!(
            normalize_key("Context pipeline!"),
            normalize_key("context   pipeline!")
        );
    }

    #[test]
    fn normalize_key_truncates_to_max_len() {
        let long = "a".repeat(500);
        assert_eq!(normalize_key(&long).len(), KEY_MAX_LEN);
    }

    #[tokio::test]
    async fn cache_hit_avoids_second_embed_call() {
        let embedder = CountingEmbedder {
            calls: AtomicUsize::new(0),
            dim: 4,
        };
        let cache = EmbeddingCache::new(200, Duration::from_secs(300));

        let first = cache
            .get_or_compute(&embedder, "Context pipeline!")
            .await
            .unwrap();
        let second = cache
            .get_or_compute(&embedder, "context   pipeline!")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_triggers_recompute() {
        let embedder = CountingEmbedder {
            calls: AtomicUsize::new(0),
            dim: 4,
        };
        let cache = EmbeddingCache::new(200, Duration::from_millis(10));

        cache.get_or_compute(&embedder, "hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.get_or_compute(&embedder, "hello").await.unwrap();

        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn eviction_respects_cache_max() {
        let embedder = CountingEmbedder {
            calls: AtomicUsize::new(0),
            dim: 2,
        };
        let cache = EmbeddingCache::new(2, Duration::from_secs(300));

        cache.get_or_compute(&embedder, "one").await.unwrap();
        cache.get_or_compute(&embedder, "two").await.unwrap();
        cache.get_or_compute(&embedder, "three").await.unwrap();

        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn invalidate_drops_all_entries() {
        let embedder = CountingEmbedder {
            calls: AtomicUsize::new(0),
            dim: 2,
        };
        let cache = EmbeddingCache::new(10, Duration::from_secs(300));
        cache.get_or_compute(&embedder, "one").await.unwrap();
        cache.invalidate().await;
        assert_eq!(cache.len().await, 0);
    }
}
