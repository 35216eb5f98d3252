//! Response cache keyed by `(agent_id, normalized user text)`.
//!
//! A hit lets the orchestrator skip the LLM entirely and feed the cached
//! text straight to TTS. Sessions without an agent id share the empty
//! agent scope.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Clone)]
struct CachedResponse {
    response: String,
    cached_at: Instant,
}

pub struct ResponseCache {
    inner: RwLock<LruCache<(String, String), CachedResponse>>,
    ttl: Duration,
}

/// Lowercase, punctuation to spaces, whitespace collapsed.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.chars() {
        let c = if c.is_alphanumeric() { Some(c.to_ascii_lowercase()) } else { None };
        match c {
            Some(c) => {
                out.push(c);
                last_space = false;
            }
            None if !last_space => {
                out.push(' ');
                last_space = true;
            }
            None => {}
        }
    }
    out.trim_end().to_string()
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: RwLock::new(LruCache::new(cap)),
            ttl,
        }
    }

    fn key(agent_id: Option<&str>, text: &str) -> (String, String) {
        (agent_id.unwrap_or_default().to_string(), normalize(text))
    }

    pub async fn get(&self, agent_id: Option<&str>, text: &str) -> Option<String> {
        let key = Self::key(agent_id, text);
        let inner = self.inner.read().await;
        let entry = inner.peek(&key)?;
        if Instant::now().duration_since(entry.cached_at) < self.ttl {
            Some(entry.response.clone())
        } else {
            None
        }
    }

    pub async fn put(&self, agent_id: Option<&str>, text: &str, response: &str) {
        let key = Self::key(agent_id, text);
        let mut inner = self.inner.write().await;
        inner.put(
            key,
            CachedResponse {
                response: response.to_string(),
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries. Returns how many were purged.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let expired: Vec<(String, String)> = inner
            .iter()
            .filter(|(_, e)| now.duration_since(e.cached_at) >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.pop(key);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("I want a QUOTE."), "i want a quote");
        assert_eq!(normalize("  hello,   world!! "), "hello world");
        assert_eq!(normalize(""), "");
    }

    #[tokio::test]
    async fn hit_is_scoped_by_agent() {
        let cache = ResponseCache::new(16, Duration::from_secs(300));
        cache.put(Some("agent-a"), "What are your hours?", "9 to 5.").await;
        assert_eq!(
            cache.get(Some("agent-a"), "what are your hours").await.as_deref(),
            Some("9 to 5.")
        );
        assert!(cache.get(Some("agent-b"), "what are your hours").await.is_none());
        assert!(cache.get(None, "what are your hours").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = ResponseCache::new(16, Duration::from_millis(100));
        cache.put(None, "hi", "hello").await;
        assert!(cache.get(None, "hi").await.is_some());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cache.get(None, "hi").await.is_none());
        assert_eq!(cache.purge_expired().await, 1);
    }
}
