//! Per-sender conversation history.
//!
//! Each sender owns an independently lockable [`Conversation`]. The router holds the lock
//! for a whole turn, so concurrent messages from one sender are serialized while different
//! senders never contend and their turns never interleave.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// Ordered history for one sender.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub turns: Vec<Turn>,
}

impl Conversation {
    /// Append a completed exchange (user text then model reply), dropping the oldest turns
    /// beyond `max_turns` when set.
    pub fn record_exchange(
        &mut self,
        user_text: impl Into<String>,
        reply: impl Into<String>,
        max_turns: Option<usize>,
    ) {
        self.turns.push(Turn::user(user_text));
        self.turns.push(Turn::model(reply));
        if let Some(max) = max_turns {
            if self.turns.len() > max {
                let excess = self.turns.len() - max;
                self.turns.drain(..excess);
            }
        }
    }
}

/// Locked access to one sender's conversation. Dropping it releases the lock.
pub type ConversationGuard = OwnedMutexGuard<Conversation>;

/// In-memory store: sender id -> conversation.
pub struct ConversationStore {
    inner: Arc<RwLock<HashMap<String, Arc<Mutex<Conversation>>>>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn entry(&self, sender_id: &str) -> Arc<Mutex<Conversation>> {
        if let Some(c) = self.inner.read().await.get(sender_id) {
            return c.clone();
        }
        self.inner
            .write()
            .await
            .entry(sender_id.to_string())
            .or_default()
            .clone()
    }

    /// Exclusive access to the sender's conversation, creating it on first use.
    pub async fn lock(&self, sender_id: &str) -> ConversationGuard {
        self.entry(sender_id).await.lock_owned().await
    }

    /// Snapshot of the sender's turns (empty if unknown). Waits for any in-flight turn.
    pub async fn history(&self, sender_id: &str) -> Vec<Turn> {
        let conv = self.inner.read().await.get(sender_id).cloned();
        match conv {
            Some(c) => c.lock().await.turns.clone(),
            None => Vec::new(),
        }
    }

    /// Forget a sender's history.
    pub async fn remove(&self, sender_id: &str) {
        self.inner.write().await.remove(sender_id);
    }

    /// Number of senders with a conversation.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_exchange_caps_oldest_first() {
        let mut c = Conversation::default();
        c.record_exchange("q1", "a1", Some(2));
        c.record_exchange("q2", "a2", Some(2));
        assert_eq!(c.turns, vec![Turn::user("q2"), Turn::model("a2")]);
    }

    #[test]
    fn record_exchange_unbounded() {
        let mut c = Conversation::default();
        for i in 0..5 {
            c.record_exchange(format!("q{}", i), format!("a{}", i), None);
        }
        assert_eq!(c.turns.len(), 10);
    }

    #[tokio::test]
    async fn lock_creates_and_persists() {
        let store = ConversationStore::new();
        {
            let mut g = store.lock("u1").await;
            g.record_exchange("hi", "hello", None);
        }
        assert_eq!(store.history("u1").await.len(), 2);
        assert!(store.history("u2").await.is_empty());
        assert_eq!(store.len().await, 1);
        store.remove("u1").await;
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn same_sender_is_exclusive() {
        let store = Arc::new(ConversationStore::new());
        let guard = store.lock("u1").await;
        let s2 = store.clone();
        let waiter = tokio::spawn(async move {
            let _g = s2.lock("u1").await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
