pub mod aggregate;
pub mod ai;
pub mod api;
pub mod config;
pub mod error;
pub mod guard;
pub mod hooks;
pub mod keys;
pub mod learn;
pub mod pipeline;
pub mod prompts;
pub mod search;
pub mod store;
pub mod util;

use std::sync::Arc;

pub type SharedStore = Arc<store::FactStore>;

/// Run a blocking store operation on tokio's blocking thread pool.
///
/// All synchronous FactStore calls in async context MUST go through this
/// to avoid starving tokio worker threads.
pub async fn store_call<F, T>(store: &SharedStore, f: F) -> Result<T, error::MnemoError>
where
    F: FnOnce(&store::FactStore) -> T + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| error::MnemoError::Internal(e.to_string()))
}

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub cfg: Arc<config::Config>,
    pub paths: Arc<config::Paths>,
    pub ai: Option<ai::AiConfig>,
    pub api_key: Option<String>,
    pub embed_cache: EmbedCache,
    pub started_at: std::time::Instant,
}

use lru::LruCache;
use std::num::NonZeroUsize;

/// LRU cache for query embeddings to avoid repeated API calls.
/// Key = query text, Value = embedding vector.
#[derive(Clone)]
pub struct EmbedCache {
    inner: Arc<parking_lot::Mutex<EmbedCacheInner>>,
    store: Option<SharedStore>,
}

struct EmbedCacheInner {
    cache: LruCache<String, Vec<f32>>,
    hits: u64,
    misses: u64,
}

impl EmbedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(EmbedCacheInner {
                cache: LruCache::new(
                    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(128).unwrap()),
                ),
                hits: 0,
                misses: 0,
            })),
            store: None,
        }
    }

    /// Create and warm from the persistent store-side cache.
    pub fn with_store(capacity: usize, store: &SharedStore) -> Self {
        let entries = store.embed_cache_load_all();
        let loaded = entries.len();
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(128).unwrap());
        let mut cache = LruCache::new(cap);
        for (q, emb) in entries {
            cache.put(q, emb);
        }
        if loaded > 0 {
            tracing::info!(loaded, "embed cache warmed from store");
        }
        Self {
            inner: Arc::new(parking_lot::Mutex::new(EmbedCacheInner {
                cache,
                hits: 0,
                misses: 0,
            })),
            store: Some(store.clone()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock();
        let val = inner.cache.get(key).cloned();
        if val.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        val
    }

    pub fn insert(&self, key: String, value: Vec<f32>) {
        if let Some(ref store) = self.store {
            store.embed_cache_put(&key, &value);
        }
        let mut inner = self.inner.lock();
        inner.cache.put(key, value);
    }

    pub fn stats(&self) -> (usize, usize, u64, u64) {
        let inner = self.inner.lock();
        (inner.cache.len(), inner.cache.cap().get(), inner.hits, inner.misses)
    }
}

/// Embed a search query, going through the cache first. Returns None when
/// no provider is configured or the call fails — callers degrade to keyword
/// search.
pub async fn query_embedding(
    ai_cfg: Option<&ai::AiConfig>,
    cache: &EmbedCache,
    query: &str,
) -> Option<Vec<f32>> {
    let ai_cfg = ai_cfg?;
    if let Some(hit) = cache.get(query) {
        return Some(hit);
    }
    match ai::get_embeddings(ai_cfg, &[query.to_string()]).await {
        Ok(mut result) if !result.embeddings.is_empty() => {
            let emb = result.embeddings.remove(0);
            cache.insert(query.to_string(), emb.clone());
            Some(emb)
        }
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "query embedding failed, keyword-only search");
            None
        }
    }
}
