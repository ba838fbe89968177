//! Conversation memory for the request router
//!
//! Histories are keyed by conversation id with lazy creation and hit-expire
//! semantics: an entry idle past its TTL is dropped on next touch. Each
//! conversation carries its own lock, which is how the router serialises to
//! one in-flight call per conversation.

use crate::llm::ChatTurn;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

struct ConversationEntry {
    turns: Vec<ChatTurn>,
    last_touch: Instant,
    guard: Arc<Mutex<()>>,
}

impl ConversationEntry {
    fn new() -> Self {
        Self {
            turns: Vec::new(),
            last_touch: Instant::now(),
            guard: Arc::new(Mutex::new(())),
        }
    }
}

/// Bounded, expiring store of (role, content) histories.
pub struct ConversationStore {
    ttl: Duration,
    max_turns: usize,
    inner: Mutex<HashMap<String, ConversationEntry>>,
}

impl ConversationStore {
    pub fn new(ttl: Duration, max_turns: usize) -> Self {
        Self {
            ttl,
            max_turns,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// The per-conversation lock. Callers hold it across the whole send so
    /// turns for one conversation never interleave.
    pub async fn guard(&self, conv_id: &str) -> Arc<Mutex<()>> {
        let mut inner = self.inner.lock().await;
        let entry = self.fresh_entry(&mut inner, conv_id);
        entry.guard.clone()
    }

    pub async fn history(&self, conv_id: &str) -> Vec<ChatTurn> {
        let mut inner = self.inner.lock().await;
        let entry = self.fresh_entry(&mut inner, conv_id);
        entry.turns.clone()
    }

    /// Record one successful exchange, trimming the oldest turns beyond the
    /// bound.
    pub async fn append_exchange(&self, conv_id: &str, user: ChatTurn, assistant: ChatTurn) {
        let mut inner = self.inner.lock().await;
        let max_turns = self.max_turns;
        let entry = self.fresh_entry(&mut inner, conv_id);
        entry.turns.push(user);
        entry.turns.push(assistant);
        if entry.turns.len() > max_turns {
            let excess = entry.turns.len() - max_turns;
            entry.turns.drain(0..excess);
        }
        entry.last_touch = Instant::now();
    }

    /// Drop every idle-expired conversation; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let ttl = self.ttl;
        let before = inner.len();
        inner.retain(|_, entry| entry.last_touch.elapsed() < ttl);
        before - inner.len()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Fetch-or-create, resetting an entry that sat idle past the TTL.
    fn fresh_entry<'a>(
        &self,
        inner: &'a mut HashMap<String, ConversationEntry>,
        conv_id: &str,
    ) -> &'a mut ConversationEntry {
        let expired = inner
            .get(conv_id)
            .map(|e| e.last_touch.elapsed() >= self.ttl)
            .unwrap_or(false);
        if expired {
            debug!(conversation_id = %conv_id, "conversation expired, starting fresh");
            inner.remove(conv_id);
        }
        let entry = inner
            .entry(conv_id.to_string())
            .or_insert_with(ConversationEntry::new);
        entry.last_touch = Instant::now();
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::TurnRole;

    #[tokio::test]
    async fn test_history_starts_empty_and_accumulates() {
        let store = ConversationStore::new(Duration::from_secs(60), 40);
        assert!(store.history("c1").await.is_empty());

        store
            .append_exchange("c1", ChatTurn::user("q1"), ChatTurn::assistant("a1"))
            .await;
        store
            .append_exchange("c1", ChatTurn::user("q2"), ChatTurn::assistant("a2"))
            .await;

        let history = store.history("c1").await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "q1");
        assert_eq!(history[3].content, "a2");
        assert_eq!(history[3].role, TurnRole::Assistant);
    }

    #[tokio::test]
    async fn test_conversations_are_isolated() {
        let store = ConversationStore::new(Duration::from_secs(60), 40);
        store
            .append_exchange("c1", ChatTurn::user("q"), ChatTurn::assistant("a"))
            .await;
        assert!(store.history("c2").await.is_empty());
        assert_eq!(store.active_count().await, 2);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = ConversationStore::new(Duration::from_secs(60), 4);
        for n in 0..5 {
            store
                .append_exchange(
                    "c1",
                    ChatTurn::user(format!("q{n}")),
                    ChatTurn::assistant(format!("a{n}")),
                )
                .await;
        }
        let history = store.history("c1").await;
        assert_eq!(history.len(), 4);
        // Oldest turns were trimmed first.
        assert_eq!(history[0].content, "q3");
    }

    #[tokio::test]
    async fn test_idle_conversation_expires_on_touch() {
        let store = ConversationStore::new(Duration::from_millis(0), 40);
        store
            .append_exchange("c1", ChatTurn::user("q"), ChatTurn::assistant("a"))
            .await;
        // TTL zero: the next touch sees an expired entry and resets it.
        assert!(store.history("c1").await.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired_drops_idle_entries() {
        let store = ConversationStore::new(Duration::from_millis(0), 40);
        store
            .append_exchange("c1", ChatTurn::user("q"), ChatTurn::assistant("a"))
            .await;
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.active_count().await, 0);
    }
}
