//! In-memory reference store
//!
//! Implements both collaborator traits over tokio locks and per-collection
//! broadcast channels. Used by embedders that need no durability and by the
//! test suites. Secrets are compared in plaintext here; real backends hash
//! (see `kindred-store`).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use super::{
    ChangeEvent, ChangeFeed, CredentialStore, DocumentStore, NewAccount, PutMode, PutOutcome,
    PROFILES,
};
use crate::error::{KindredError, Result};
use crate::models::Principal;

const FEED_CAPACITY: usize = 32;

/// Handle-uniqueness sentinels keyed by username.
const HANDLES: &str = "handles";

/// In-memory document + credential store.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    /// Broadcast channels for each collection
    channels: RwLock<HashMap<String, broadcast::Sender<ChangeEvent>>>,
    /// Plaintext secrets keyed by principal id
    secrets: RwLock<HashMap<String, String>>,
    /// Restorable session: principal id
    session: RwLock<Option<String>>,
    /// Polls that must fail before a seeded session becomes visible
    restore_delay: AtomicU32,
    /// Failure injection: every operation reports `StoreUnavailable`
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            secrets: RwLock::new(HashMap::new()),
            session: RwLock::new(None),
            restore_delay: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KindredError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Get broadcast channel for a collection.
    async fn get_channel(&self, collection: &str) -> broadcast::Sender<ChangeEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    /// Broadcast the current contents of a collection to its subscribers.
    async fn notify(&self, collection: &str, documents: BTreeMap<String, Value>) {
        let channel = self.get_channel(collection).await;
        let _ = channel.send(ChangeEvent {
            collection: collection.to_string(),
            documents,
        });
    }

    /// Seed a profile directly, as if written by another client.
    pub async fn seed_profile(&self, principal: &Principal) -> Result<()> {
        let doc = principal.to_document()?;
        self.put(PROFILES, &principal.id, doc, PutMode::Upsert)
            .await?;
        Ok(())
    }

    /// Seed a restorable session, visible after `delay_polls` failed polls.
    pub async fn seed_session(&self, principal_id: &str, delay_polls: u32) {
        *self.session.write().await = Some(principal_id.to_string());
        self.restore_delay.store(delay_polls, Ordering::SeqCst);
    }

    /// Toggle failure injection.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live change feeds for a collection.
    pub async fn listener_count(&self, collection: &str) -> usize {
        self.channels
            .read()
            .await
            .get(collection)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop the broadcast channel for a collection, ending every live feed.
    /// Simulates a lapsed store-side subscription; the next `subscribe`
    /// call establishes a fresh channel.
    pub async fn drop_channel(&self, collection: &str) {
        self.channels.write().await.remove(collection);
    }

    async fn load_principal(&self, id: &str) -> Result<Option<Principal>> {
        match self.get(PROFILES, id).await? {
            Some(doc) => Ok(Some(Principal::from_document(doc)?)),
            None => Ok(None),
        }
    }

    async fn find_profile(&self, identifier: &str) -> Result<Option<Principal>> {
        let docs = self.snapshot(PROFILES).await?;
        let mut profiles = Vec::with_capacity(docs.len());
        for doc in docs.into_values() {
            profiles.push(Principal::from_document(doc)?);
        }

        // Email match takes priority over a handle match.
        if let Some(by_email) = profiles.iter().find(|p| p.email == identifier) {
            return Ok(Some(by_email.clone()));
        }
        Ok(profiles.into_iter().find(|p| p.username == identifier))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        self.check_available()?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn put(
        &self,
        collection: &str,
        key: &str,
        document: Value,
        mode: PutMode,
    ) -> Result<PutOutcome> {
        self.check_available()?;

        // Conflict check and insert under one write lock, so concurrent
        // CreateOnly writers cannot both succeed.
        let contents = {
            let mut collections = self.collections.write().await;
            let docs = collections.entry(collection.to_string()).or_default();
            if mode == PutMode::CreateOnly && docs.contains_key(key) {
                return Ok(PutOutcome::Conflict);
            }
            docs.insert(key.to_string(), document);
            docs.clone()
        };

        self.notify(collection, contents).await;
        Ok(PutOutcome::Written)
    }

    async fn snapshot(&self, collection: &str) -> Result<BTreeMap<String, Value>> {
        self.check_available()?;
        let collections = self.collections.read().await;
        Ok(collections.get(collection).cloned().unwrap_or_default())
    }

    async fn subscribe(&self, collection: &str) -> Result<ChangeFeed> {
        self.check_available()?;
        let channel = self.get_channel(collection).await;
        Ok(ChangeFeed::new(channel.subscribe()))
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn restore_session(&self) -> Result<Option<Principal>> {
        self.check_available()?;

        // Simulate an eventually-available session backend.
        if self.restore_delay.load(Ordering::SeqCst) > 0 {
            self.restore_delay.fetch_sub(1, Ordering::SeqCst);
            return Ok(None);
        }

        let id = match self.session.read().await.clone() {
            Some(id) => id,
            None => return Ok(None),
        };
        self.load_principal(&id).await
    }

    async fn authenticate(&self, identifier: &str, secret: &str) -> Result<Principal> {
        self.check_available()?;

        let principal = self
            .find_profile(identifier)
            .await?
            .ok_or(KindredError::InvalidCredentials)?;

        let secret_matches = {
            let secrets = self.secrets.read().await;
            secrets
                .get(&principal.id)
                .map(|s| s == secret)
                .unwrap_or(false)
        };
        if !secret_matches {
            return Err(KindredError::InvalidCredentials);
        }
        *self.session.write().await = Some(principal.id.clone());
        Ok(principal)
    }

    async fn create_account(&self, account: NewAccount) -> Result<Principal> {
        self.check_available()?;

        let docs = self.snapshot(PROFILES).await?;
        for doc in docs.into_values() {
            let existing = Principal::from_document(doc)?;
            if existing.username == account.principal.username {
                return Err(KindredError::DuplicateIdentity(
                    account.principal.username.clone(),
                ));
            }
        }

        let principal = account.principal;
        // CreateOnly on a username-keyed sentinel makes the uniqueness
        // check atomic against concurrent signups racing past the scan.
        let claim = self
            .put(
                HANDLES,
                &principal.username,
                serde_json::json!({ "principal_id": principal.id }),
                PutMode::CreateOnly,
            )
            .await?;
        if claim == PutOutcome::Conflict {
            return Err(KindredError::DuplicateIdentity(principal.username.clone()));
        }

        self.secrets
            .write()
            .await
            .insert(principal.id.clone(), account.password);
        self.put(
            PROFILES,
            &principal.id,
            principal.to_document()?,
            PutMode::CreateOnly,
        )
        .await?;
        *self.session.write().await = Some(principal.id.clone());

        info!("[Store] Account created: {}", principal.username);
        Ok(principal)
    }

    async fn clear_session(&self) -> Result<()> {
        self.check_available()?;
        *self.session.write().await = None;
        Ok(())
    }
}
