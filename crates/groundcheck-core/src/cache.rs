//! Short-TTL LRU response cache with in-flight de-duplication.
//!
//! Concurrent [`ResponseCache::get_or_create`] calls for one key share a
//! single computation. The pending entry is registered under the lock
//! before anything is awaited, and is cleared on settle only if it still
//! refers to the same computation (an `invalidate` in between wins).
//! Failed computations are never cached, and
//! [`ResponseCache::get_or_create_if`] lets the caller refuse to store
//! values it considers failures.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use crate::domain::{AnswerMode, AnswerRequest, CacheError, Preferences};

/// Cache tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum live entries; least recently used are evicted beyond this.
    pub capacity: usize,
    pub default_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 256,
            default_ttl_ms: 5 * 60 * 1000,
        }
    }
}

type SharedCompute<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

struct Pending<T> {
    id: u64,
    future: SharedCompute<T>,
}

struct Inner<T> {
    entries: LruCache<String, Entry<T>>,
    pending: HashMap<String, Pending<T>>,
    next_id: u64,
}

impl<T: Clone> Inner<T> {
    /// Live value for `key`, refreshing its recency. Expired entries are dropped.
    fn lookup(&mut self, key: &str, now: Instant) -> Option<T> {
        let expired = now >= self.entries.peek(key)?.expires_at;
        if expired {
            self.entries.pop(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    fn insert(&mut self, key: String, value: T, expires_at: Instant) {
        self.entries.put(key, Entry { value, expires_at });
    }
}

/// Cloning is cheap; clones share the same storage.
pub struct ResponseCache<T> {
    state: Arc<Mutex<Inner<T>>>,
    default_ttl: Duration,
}

impl<T> Clone for ResponseCache<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            default_ttl: self.default_ttl,
        }
    }
}

fn lock<T>(state: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> ResponseCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Arc::new(Mutex::new(Inner {
                entries: LruCache::new(capacity),
                pending: HashMap::new(),
                next_id: 0,
            })),
            default_ttl: Duration::from_millis(config.default_ttl_ms),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        lock(&self.state).lookup(key, Instant::now())
    }

    /// Store `value`; `ttl` defaults to the configured TTL. Zero expires at once.
    pub fn set(&self, key: impl Into<String>, value: T, ttl: Option<Duration>) {
        let expires_at = Instant::now() + ttl.unwrap_or(self.default_ttl);
        lock(&self.state).insert(key.into(), value, expires_at);
    }

    /// Drop the entry and any in-flight computation for `key`.
    ///
    /// Callers already awaiting the computation still get its result, but
    /// the result is not stored.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut inner = lock(&self.state);
        let pending = inner.pending.remove(key).is_some();
        inner.entries.pop(key).is_some() || pending
    }

    /// Cached value, or the result of `compute` shared by every concurrent
    /// caller for `key`.
    ///
    /// `compute` is called while the cache lock is held; it must only build
    /// the future, not touch this cache.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &str,
        compute: F,
        ttl: Option<Duration>,
    ) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.get_or_create_if(key, compute, ttl, |_: &T| true).await
    }

    /// Like [`get_or_create`](Self::get_or_create), but a successful value is
    /// stored only when `should_store` accepts it.
    ///
    /// The check runs inside the settle step, so a rejected value never
    /// touches a newer computation registered for the same key. Callers that
    /// join an existing computation share its predicate, not their own.
    pub async fn get_or_create_if<F, Fut, P>(
        &self,
        key: &str,
        compute: F,
        ttl: Option<Duration>,
        should_store: P,
    ) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        P: Fn(&T) -> bool + Send + 'static,
    {
        let shared = {
            let mut inner = lock(&self.state);
            if let Some(value) = inner.lookup(key, Instant::now()) {
                return Ok(value);
            }
            match inner.pending.get(key) {
                Some(pending) => pending.future.clone(),
                None => {
                    let id = inner.next_id;
                    inner.next_id += 1;
                    let shared =
                        self.settle(key.to_string(), id, compute(), ttl, should_store);
                    inner.pending.insert(
                        key.to_string(),
                        Pending {
                            id,
                            future: shared.clone(),
                        },
                    );
                    shared
                }
            }
        };
        shared.await
    }

    fn settle<Fut, P>(
        &self,
        key: String,
        id: u64,
        work: Fut,
        ttl: Option<Duration>,
        should_store: P,
    ) -> SharedCompute<T>
    where
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        P: Fn(&T) -> bool + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let ttl = ttl.unwrap_or(self.default_ttl);
        async move {
            let result = work.await.map_err(|e| CacheError::Compute(Arc::new(e)));
            let mut inner = lock(&state);
            if inner.pending.get(&key).map(|p| p.id) == Some(id) {
                inner.pending.remove(&key);
                if let Ok(value) = &result {
                    if should_store(value) {
                        inner.insert(key, value.clone(), Instant::now() + ttl);
                    }
                }
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Fill `key` in the background. Best-effort: errors are logged and dropped.
    pub fn warm<F, Fut>(&self, key: impl Into<String>, compute: F) -> JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let cache = self.clone();
        let key = key.into();
        tokio::spawn(async move {
            if let Err(e) = cache.get_or_create(&key, compute, None).await {
                warn!(key = %key, error = %e, "cache warm failed");
            }
        })
    }

    /// Live and not-yet-purged expired entries.
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Drop every expired entry now rather than on next access.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = lock(&self.state);
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| now >= e.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        expired.len()
    }
}

#[derive(Serialize)]
struct KeyFields<'a> {
    question: String,
    session_id: Option<&'a str>,
    graph_id: Option<&'a str>,
    mode: AnswerMode,
    preferences: &'a Preferences,
    strict_citations: bool,
    token_budget: Option<usize>,
}

/// Lowercase, trim, collapse internal whitespace.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stable SHA-256 fingerprint of the fields that determine an answer.
pub fn cache_key(request: &AnswerRequest) -> String {
    let fields = KeyFields {
        question: normalize_question(&request.question),
        session_id: request.session_id.as_deref(),
        graph_id: request.graph_id.as_deref(),
        mode: request.mode,
        preferences: &request.preferences,
        strict_citations: request.strict_citations,
        token_budget: request.token_budget,
    };
    // Serializing plain structs and strings cannot fail.
    let bytes = serde_json::to_vec(&fields).unwrap_or_default();
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize, ttl_ms: u64) -> ResponseCache<String> {
        ResponseCache::new(&CacheConfig {
            enabled: true,
            capacity,
            default_ttl_ms: ttl_ms,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let c = cache(8, 1_000);
        c.set("k", "v".to_string(), None);
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(c.get("k").as_deref(), Some("v"));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(c.get("k"), None);
        assert!(c.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_is_immediately_expired() {
        let c = cache(8, 1_000);
        c.set("k", "v".to_string(), Some(Duration::ZERO));
        assert_eq!(c.get("k"), None);
    }

    #[tokio::test]
    async fn test_lru_eviction_respects_get_recency() {
        let c = cache(2, 60_000);
        c.set("a", "1".to_string(), None);
        c.set("b", "2".to_string(), None);
        assert!(c.get("a").is_some());
        c.set("c", "3".to_string(), None);
        assert!(c.get("a").is_some());
        assert!(c.get("b").is_none());
        assert!(c.get("c").is_some());
        assert_eq!(c.len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_value_is_returned_but_not_stored() {
        let c = cache(4, 60_000);
        let value = c
            .get_or_create_if(
                "k",
                || async { Ok("apology".to_string()) },
                None,
                |v: &String| v != "apology",
            )
            .await
            .unwrap();
        assert_eq!(value, "apology");
        assert!(c.is_empty());
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let c = cache(4, 60_000);
        c.set("a", "1".to_string(), None);
        assert!(c.invalidate("a"));
        assert!(!c.invalidate("a"));
        assert_eq!(c.get("a"), None);
    }

    #[test]
    fn test_cache_key_normalizes_question() {
        let a = AnswerRequest::new("  What is   the Capital of FRANCE? ");
        let b = AnswerRequest::new("what is the capital of france?");
        assert_eq!(cache_key(&a), cache_key(&b));
        assert_eq!(cache_key(&a).len(), 64);

        let c = b.clone().with_session("s1");
        assert_ne!(cache_key(&b), cache_key(&c));
        let d = b.clone().with_mode(AnswerMode::Deep);
        assert_ne!(cache_key(&b), cache_key(&d));
    }
}
