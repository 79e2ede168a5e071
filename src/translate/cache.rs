//! In-memory LRU translation cache with TTL.
//! Key: blake3 hash of (target_lang | prepared source text).

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

struct CacheEntry {
    translated_text: String,
    inserted_at: Instant,
}

pub struct TranslationCache {
    inner: Mutex<LruCache<[u8; 32], CacheEntry>>,
    ttl: Duration,
}

impl TranslationCache {
    /// Returns `None` for a zero capacity, which disables caching.
    pub fn new(capacity: usize, ttl: Duration) -> Option<Self> {
        let capacity = NonZeroUsize::new(capacity)?;
        Some(Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        })
    }

    pub fn compute_key(target_lang: &str, text: &str) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(target_lang.as_bytes());
        hasher.update(b"|");
        hasher.update(text.as_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Look up a cached translation. Returns None if absent or expired.
    pub fn get(&self, target_lang: &str, text: &str) -> Option<String> {
        let key = Self::compute_key(target_lang, text);
        let mut cache = self.inner.lock();
        if let Some(entry) = cache.get(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.translated_text.clone());
            }
            cache.pop(&key);
        }
        None
    }

    /// Callers insert only output that passed validation. An entry outlives
    /// the page that produced it, so a corrupted translation stored here
    /// would be served to every later page until the TTL ran out.
    pub fn insert(&self, target_lang: &str, text: &str, translated_text: String) {
        let key = Self::compute_key(target_lang, text);
        self.inner.lock().put(
            key,
            CacheEntry {
                translated_text,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
