//! Storage collaborator traits
//!
//! The core issues no wire protocol of its own; it consumes two abstract
//! collaborators. `DocumentStore` offers key-based lookup, document writes,
//! and change-notification subscriptions over named collections.
//! `CredentialStore` owns account records and the restorable session.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::error::{KindredError, Result};
use crate::models::{Principal, ProfileDraft};

pub mod memory;

pub use memory::MemoryStore;

/// Collection holding profile documents.
pub const PROFILES: &str = "profiles";
/// Collection holding conversation documents.
pub const CONVERSATIONS: &str = "conversations";

/// Write mode for [`DocumentStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Fail with [`PutOutcome::Conflict`] if the key already exists. The
    /// existence check and the write are atomic with respect to concurrent
    /// creators.
    CreateOnly,
    Upsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// `CreateOnly` lost a race; the key already holds a document.
    Conflict,
}

/// Change notification carrying the full collection contents as of the
/// write that triggered it.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: String,
    pub documents: BTreeMap<String, Value>,
}

/// Receiver half of a collection subscription.
///
/// Dropping the feed releases the store-side listener.
pub struct ChangeFeed {
    rx: broadcast::Receiver<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { rx }
    }

    /// Next change event. Lagged events are skipped: every event carries
    /// the full collection, so only the most recent one matters. Fails with
    /// `StoreUnavailable` once the store side has gone away.
    pub async fn next(&mut self) -> Result<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("[Store] Change feed lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(KindredError::StoreUnavailable(
                        "change feed closed".to_string(),
                    ));
                }
            }
        }
    }
}

/// Key-addressed document storage with change-notification subscriptions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    async fn put(
        &self,
        collection: &str,
        key: &str,
        document: Value,
        mode: PutMode,
    ) -> Result<PutOutcome>;

    /// Current full contents of a collection.
    async fn snapshot(&self, collection: &str) -> Result<BTreeMap<String, Value>>;

    /// Subscribe to change notifications for a collection.
    async fn subscribe(&self, collection: &str) -> Result<ChangeFeed>;
}

/// A fully-resolved account creation request. The session layer derives the
/// placeholder email and the age before handing the record over; the store
/// only enforces uniqueness and persists.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub principal: Principal,
    pub password: String,
}

impl NewAccount {
    /// Pair a resolved principal with the secret from its draft.
    pub fn new(principal: Principal, draft: &ProfileDraft) -> Self {
        Self {
            principal,
            password: draft.password.clone(),
        }
    }
}

/// Account records and the restorable session.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Previously persisted session, if one is available yet. Session
    /// restoration is asynchronous on some backends; `None` means "not
    /// available right now", not "logged out".
    async fn restore_session(&self) -> Result<Option<Principal>>;

    /// Match `identifier` (email-shaped or plain handle) and `secret`
    /// against a stored account. Fails with `InvalidCredentials`.
    async fn authenticate(&self, identifier: &str, secret: &str) -> Result<Principal>;

    /// Persist a new account. Fails with `DuplicateIdentity` if the handle
    /// is already registered.
    async fn create_account(&self, account: NewAccount) -> Result<Principal>;

    /// Forget the restorable session. Idempotent.
    async fn clear_session(&self) -> Result<()>;
}
