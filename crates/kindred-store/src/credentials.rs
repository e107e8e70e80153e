//! Credential store over the JSON document store
//!
//! Accounts live in the `profiles` collection; password hashes live in a
//! private `credentials` collection keyed by principal id, so they never
//! travel with profile documents. The restorable session is a small
//! `session.json` slot next to the collections.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bcrypt::{hash, verify, DEFAULT_COST};
use serde_json::json;
use tokio::fs;
use tracing::{info, warn};

use kindred_core::error::{KindredError, Result};
use kindred_core::models::Principal;
use kindred_core::store::{CredentialStore, DocumentStore, NewAccount, PutMode, PutOutcome, PROFILES};

use crate::json_store::JsonDocumentStore;

/// Private collection holding bcrypt hashes keyed by principal id.
const CREDENTIALS: &str = "credentials";

/// Handle-uniqueness sentinels keyed by username.
const HANDLES: &str = "handles";

const SESSION_FILE: &str = "session.json";

pub struct JsonCredentialStore {
    store: Arc<JsonDocumentStore>,
    session_path: PathBuf,
}

impl JsonCredentialStore {
    pub fn new(store: Arc<JsonDocumentStore>, root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            session_path: root.into().join(SESSION_FILE),
        }
    }

    async fn find_profile(&self, identifier: &str) -> Result<Option<Principal>> {
        let docs = self.store.snapshot(PROFILES).await?;
        let mut profiles = Vec::with_capacity(docs.len());
        for (key, doc) in docs {
            match Principal::from_document(doc) {
                Ok(principal) => profiles.push(principal),
                Err(e) => warn!("[Credentials] Skipping malformed profile {}: {}", key, e),
            }
        }

        // Email match takes priority over a handle match.
        if let Some(by_email) = profiles.iter().find(|p| p.email == identifier) {
            return Ok(Some(by_email.clone()));
        }
        Ok(profiles.into_iter().find(|p| p.username == identifier))
    }

    async fn write_session(&self, principal_id: &str) -> Result<()> {
        let temp_path = self.session_path.with_extension("tmp");
        let body = serde_json::to_string(&json!({ "principal_id": principal_id }))?;
        fs::write(&temp_path, body)
            .await
            .map_err(|e| KindredError::StoreUnavailable(e.to_string()))?;
        fs::rename(&temp_path, &self.session_path)
            .await
            .map_err(|e| KindredError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for JsonCredentialStore {
    async fn restore_session(&self) -> Result<Option<Principal>> {
        let content = match fs::read_to_string(&self.session_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KindredError::StoreUnavailable(e.to_string())),
        };

        let slot: serde_json::Value = serde_json::from_str(&content)?;
        let Some(id) = slot.get("principal_id").and_then(|v| v.as_str()) else {
            warn!("[Credentials] Session slot malformed, ignoring");
            return Ok(None);
        };

        match self.store.get(PROFILES, id).await? {
            Some(doc) => Ok(Some(Principal::from_document(doc)?)),
            None => {
                warn!("[Credentials] Session points at unknown principal {}", id);
                Ok(None)
            }
        }
    }

    async fn authenticate(&self, identifier: &str, secret: &str) -> Result<Principal> {
        let principal = self
            .find_profile(identifier)
            .await?
            .ok_or(KindredError::InvalidCredentials)?;

        let stored_hash = self
            .store
            .get(CREDENTIALS, &principal.id)
            .await?
            .and_then(|doc| {
                doc.get("password_hash")
                    .and_then(|v| v.as_str().map(String::from))
            })
            .ok_or(KindredError::InvalidCredentials)?;

        let valid = verify(secret, &stored_hash)
            .map_err(|e| KindredError::StoreUnavailable(e.to_string()))?;
        if !valid {
            warn!("[Credentials] Failed login attempt for {}", identifier);
            return Err(KindredError::InvalidCredentials);
        }

        self.write_session(&principal.id).await?;
        info!("[Credentials] Authenticated {}", principal.username);
        Ok(principal)
    }

    async fn create_account(&self, account: NewAccount) -> Result<Principal> {
        if self
            .find_profile(&account.principal.username)
            .await?
            .is_some()
        {
            return Err(KindredError::DuplicateIdentity(
                account.principal.username.clone(),
            ));
        }

        let principal = account.principal;
        // CreateOnly on a username-keyed sentinel makes the uniqueness
        // check atomic against concurrent signups racing past the scan.
        let claim = self
            .store
            .put(
                HANDLES,
                &principal.username,
                json!({ "principal_id": principal.id }),
                PutMode::CreateOnly,
            )
            .await?;
        if claim == PutOutcome::Conflict {
            return Err(KindredError::DuplicateIdentity(principal.username.clone()));
        }

        let password_hash = hash(&account.password, DEFAULT_COST)
            .map_err(|e| KindredError::StoreUnavailable(e.to_string()))?;

        self.store
            .put(
                CREDENTIALS,
                &principal.id,
                json!({ "password_hash": password_hash }),
                PutMode::CreateOnly,
            )
            .await?;
        // Profile writes go through Principal's serializer, which emits
        // `role` only and thereby normalizes any legacy admin flag.
        self.store
            .put(
                PROFILES,
                &principal.id,
                principal.to_document()?,
                PutMode::CreateOnly,
            )
            .await?;
        self.write_session(&principal.id).await?;

        info!("[Credentials] Account created: {}", principal.username);
        Ok(principal)
    }

    async fn clear_session(&self) -> Result<()> {
        match fs::remove_file(&self.session_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KindredError::StoreUnavailable(e.to_string())),
        }
    }
}
