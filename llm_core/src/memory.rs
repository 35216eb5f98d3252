//! In-process conversation memory.
//!
//! One entry per session, capped both per-conversation (message count) and
//! process-wide (conversation count, least-recently-updated evicted first).
//! Entries expire after an idle TTL; `evict_expired` is driven by the
//! gateway's background sweeper.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{ChatMessage, Role};

#[derive(Debug, Clone)]
pub struct ConversationStoreConfig {
    /// Total message cap per conversation: 1 system + 16 turn messages.
    pub max_messages: usize,
    /// Process-wide conversation cap.
    pub max_conversations: usize,
    /// Idle TTL after which a conversation is dropped.
    pub idle_ttl: Duration,
}

impl Default for ConversationStoreConfig {
    fn default() -> Self {
        Self {
            max_messages: 17,
            max_conversations: 1000,
            idle_ttl: Duration::from_secs(3600),
        }
    }
}

struct Entry {
    messages: Vec<ChatMessage>,
    updated_at: Instant,
}

pub struct ConversationStore {
    inner: RwLock<LruCache<String, Entry>>,
    config: ConversationStoreConfig,
}

impl ConversationStore {
    pub fn new(config: ConversationStoreConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_conversations.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: RwLock::new(LruCache::new(cap)),
            config,
        }
    }

    /// Create (or reset) a conversation. The system prompt is always the
    /// first message; an optional predefined assistant greeting follows it.
    pub async fn create(
        &self,
        session_id: &str,
        system_prompt: &str,
        first_assistant_message: Option<&str>,
    ) {
        let mut messages = vec![ChatMessage::system(system_prompt)];
        if let Some(greeting) = first_assistant_message {
            messages.push(ChatMessage::assistant(greeting));
        }
        let mut inner = self.inner.write().await;
        inner.put(
            session_id.to_string(),
            Entry { messages, updated_at: Instant::now() },
        );
    }

    pub async fn add_user_message(&self, session_id: &str, content: &str) {
        self.push(session_id, ChatMessage::user(content)).await;
    }

    pub async fn add_assistant_message(&self, session_id: &str, content: &str) {
        self.push(session_id, ChatMessage::assistant(content)).await;
    }

    pub async fn update_system_prompt(&self, session_id: &str, system_prompt: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(session_id) {
            match entry.messages.first_mut() {
                Some(first) if first.role == Role::System => {
                    first.content = system_prompt.to_string();
                }
                _ => entry
                    .messages
                    .insert(0, ChatMessage::system(system_prompt)),
            }
            entry.updated_at = Instant::now();
        }
    }

    /// Snapshot the message list for a session, if present.
    pub async fn get(&self, session_id: &str) -> Option<Vec<ChatMessage>> {
        let inner = self.inner.read().await;
        inner.peek(session_id).map(|e| e.messages.clone())
    }

    /// Drop conversations idle past the TTL. Returns how many were evicted.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .iter()
            .filter(|(_, e)| now.duration_since(e.updated_at) > self.config.idle_ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.pop(key);
        }
        expired.len()
    }

    pub async fn remove(&self, session_id: &str) {
        self.inner.write().await.pop(session_id);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn push(&self, session_id: &str, message: ChatMessage) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.get_mut(session_id) else {
            return;
        };
        entry.messages.push(message);
        entry.updated_at = Instant::now();
        // FIFO-evict oldest non-system messages past the cap.
        while entry.messages.len() > self.config.max_messages {
            let idx = if entry.messages.first().map(|m| m.role) == Some(Role::System) {
                1
            } else {
                0
            };
            if idx >= entry.messages.len() {
                break;
            }
            entry.messages.remove(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store() -> ConversationStore {
        ConversationStore::new(ConversationStoreConfig {
            max_messages: 5,
            max_conversations: 2,
            idle_ttl: Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn system_message_stays_first_under_eviction() {
        let store = small_store();
        store.create("s1", "you are helpful", None).await;
        for i in 0..10 {
            store.add_user_message("s1", &format!("q{i}")).await;
            store.add_assistant_message("s1", &format!("a{i}")).await;
        }
        let messages = store.get("s1").await.unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "you are helpful");
        // Newest turn survives.
        assert_eq!(messages.last().unwrap().content, "a9");
    }

    #[tokio::test]
    async fn global_cap_evicts_least_recently_updated() {
        let store = small_store();
        store.create("s1", "sys", None).await;
        store.create("s2", "sys", None).await;
        // Touch s1 so s2 is the least recently updated.
        store.add_user_message("s1", "hello").await;
        store.create("s3", "sys", None).await;
        assert!(store.get("s1").await.is_some());
        assert!(store.get("s2").await.is_none());
        assert!(store.get("s3").await.is_some());
    }

    #[tokio::test]
    async fn first_assistant_message_is_recorded() {
        let store = small_store();
        store.create("s1", "sys", Some("Hi, how can I help?")).await;
        let messages = store.get("s1").await.unwrap();
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hi, how can I help?");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_conversations_expire() {
        let store = small_store();
        store.create("s1", "sys", None).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        let evicted = store.evict_expired().await;
        assert_eq!(evicted, 1);
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn update_system_prompt_replaces_in_place() {
        let store = small_store();
        store.create("s1", "old", None).await;
        store.add_user_message("s1", "hi").await;
        store.update_system_prompt("s1", "new").await;
        let messages = store.get("s1").await.unwrap();
        assert_eq!(messages[0].content, "new");
        assert_eq!(messages.len(), 2);
    }
}
