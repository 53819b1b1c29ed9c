//! Recent-turn conversation store.
//!
//! Holds the bounded message window the caller hands to the pipeline as
//! `recent_turns`. Entries expire after a TTL and the store is capped in
//! size; nothing lives for the whole process lifetime.

use crate::types::{Turn, TurnRole};
use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::Op;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Most recent turns of `conversation_id`, oldest first.
    async fn recent(&self, conversation_id: &str) -> Vec<Turn>;

    async fn append_exchange(&self, conversation_id: &str, user: &str, assistant: &str);
}

pub struct MokaConversationStore {
    inner: Cache<String, Arc<Vec<Turn>>>,
    max_turns: usize,
}

impl MokaConversationStore {
    pub fn new(max_turns: usize, ttl: Duration, capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .time_to_idle(ttl)
                .build(),
            max_turns,
        }
    }
}

#[async_trait]
impl ConversationStore for MokaConversationStore {
    async fn recent(&self, conversation_id: &str) -> Vec<Turn> {
        self.inner
            .get(conversation_id)
            .await
            .map(|turns| turns.as_ref().clone())
            .unwrap_or_default()
    }

    async fn append_exchange(&self, conversation_id: &str, user: &str, assistant: &str) {
        let max_turns = self.max_turns;
        let user = Turn {
            role: TurnRole::User,
            content: user.to_string(),
        };
        let assistant = Turn {
            role: TurnRole::Assistant,
            content: assistant.to_string(),
        };

        self.inner
            .entry(conversation_id.to_string())
            .and_compute_with(|existing| {
                let mut turns = existing.map(|e| e.into_value().as_ref().clone()).unwrap_or_default();
                turns.push(user);
                turns.push(assistant);
                let skip = turns.len().saturating_sub(max_turns);
                turns.drain(..skip);
                std::future::ready(Op::Put(Arc::new(turns)))
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_window_is_bounded() {
        let store = MokaConversationStore::new(4, Duration::from_secs(60), 100);
        for i in 0..3 {
            store.append_exchange("c-1", &format!("q{}", i), &format!("a{}", i)).await;
        }

        let turns = store.recent("c-1").await;
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].content, "q1");
        assert_eq!(turns[3].role, TurnRole::Assistant);
        assert!(store.recent("other").await.is_empty());
    }
}
