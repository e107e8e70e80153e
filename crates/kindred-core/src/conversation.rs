//! Conversation Resolver
//!
//! Returns the one conversation for an unordered participant pair, creating
//! it lazily. Callers may race from different processes, so convergence
//! rests on the deterministic key plus an idempotent create-or-read
//! protocol against the store, not on any in-process lock.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{KindredError, Result};
use crate::identity::{conversation_key, participant_pair};
use crate::models::Conversation;
use crate::store::{DocumentStore, PutMode, PutOutcome, CONVERSATIONS};

pub struct ConversationResolver {
    store: Arc<dyn DocumentStore>,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Get the conversation for this pair, creating it on first message
    /// intent. At-most-one conversation exists per unordered pair: both of
    /// two racing creators return the same record, neither errors.
    pub async fn get_or_create(&self, a: &str, b: &str) -> Result<Conversation> {
        let key = conversation_key(a, b)?;

        if let Some(doc) = self.store.get(CONVERSATIONS, &key).await? {
            debug!("[Conversation] Found existing {}", key);
            return Ok(serde_json::from_value(doc)?);
        }

        let conversation = Conversation {
            id: key.clone(),
            participants: participant_pair(a, b)?,
            created_at: Utc::now(),
        };

        // The key is the document identity, never an auto-generated id, so
        // concurrent creators converge on the same record.
        let outcome = self
            .store
            .put(
                CONVERSATIONS,
                &key,
                serde_json::to_value(&conversation)?,
                PutMode::CreateOnly,
            )
            .await?;

        match outcome {
            PutOutcome::Written => {
                info!("[Conversation] Created {}", key);
                Ok(conversation)
            }
            // Lost the race: someone else created it between our read and
            // write. That is success; re-read the winner's record.
            PutOutcome::Conflict => {
                debug!("[Conversation] Create raced on {}, re-reading", key);
                match self.store.get(CONVERSATIONS, &key).await? {
                    Some(doc) => Ok(serde_json::from_value(doc)?),
                    None => Err(KindredError::StoreUnavailable(format!(
                        "conversation {} vanished after create conflict",
                        key
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn creates_once_and_reuses_regardless_of_order() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ConversationResolver::new(store.clone());

        let first = resolver.get_or_create("ana", "ben").await.unwrap();
        let second = resolver.get_or_create("ben", "ana").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(first.participants, ["ana".to_string(), "ben".to_string()]);

        let stored = store.snapshot(CONVERSATIONS).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn self_conversation_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ConversationResolver::new(store);

        let err = resolver.get_or_create("ana", "ana").await.unwrap_err();
        assert!(matches!(err, KindredError::InvalidIdentity(_)));
    }

    #[tokio::test]
    async fn create_conflict_resolves_to_existing_record() {
        let store = Arc::new(MemoryStore::new());

        // Simulate the racing winner landing between our read and write by
        // pre-creating under the same key.
        let key = conversation_key("ana", "ben").unwrap();
        let winner = Conversation {
            id: key.clone(),
            participants: ["ana".to_string(), "ben".to_string()],
            created_at: Utc::now(),
        };
        store
            .put(
                CONVERSATIONS,
                &key,
                serde_json::to_value(&winner).unwrap(),
                PutMode::CreateOnly,
            )
            .await
            .unwrap();

        let resolver = ConversationResolver::new(store);
        let resolved = resolver.get_or_create("ben", "ana").await.unwrap();
        assert_eq!(resolved.created_at, winner.created_at);
    }

    #[tokio::test]
    async fn store_unavailability_propagates() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let resolver = ConversationResolver::new(store);

        let err = resolver.get_or_create("ana", "ben").await.unwrap_err();
        assert!(matches!(err, KindredError::StoreUnavailable(_)));
    }
}
