//! Session Manager
//!
//! Owns the current authenticated principal and notifies consumers of
//! login/logout transitions over a watch channel. Session restoration from
//! persisted credentials is asynchronous on the backends we target, so
//! bootstrap polls with a bounded retry loop instead of assuming the state
//! is immediately available.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{KindredError, Result};
use crate::models::{age_on, Principal, ProfileDraft, Role};
use crate::store::{CredentialStore, DocumentStore, NewAccount, PutMode, PROFILES};

/// Lifecycle of the authenticated principal.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Before bootstrap has run.
    Unknown,
    /// Bootstrap is polling the credential store.
    Restoring,
    Authenticated(Principal),
    Anonymous,
}

impl SessionState {
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            SessionState::Authenticated(principal) => Some(principal),
            _ => None,
        }
    }
}

/// Bootstrap retry policy.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fixed attempt cap for session restoration polls.
    pub restore_attempts: u32,
    /// Fixed delay between polls.
    pub restore_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            restore_attempts: 10,
            restore_interval: Duration::from_millis(500),
        }
    }
}

/// Owns the current principal. Passed explicitly to consumers; there is no
/// ambient global current-user state.
pub struct SessionManager {
    credentials: Arc<dyn CredentialStore>,
    store: Arc<dyn DocumentStore>,
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
}

/// Editable profile fields. `id` and `role` are not editable through this
/// path.
#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub email: Option<String>,
    pub mbti: Option<crate::models::Mbti>,
    pub gender: Option<crate::models::Gender>,
    pub birth_date: Option<chrono::NaiveDate>,
    pub bio: Option<String>,
    pub avatar_url: Option<Option<String>>,
}

impl SessionManager {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        store: Arc<dyn DocumentStore>,
        config: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Unknown);
        Self {
            credentials,
            store,
            config,
            state_tx,
        }
    }

    /// Observe session transitions. The receiver always holds the latest
    /// state.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn current(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    fn transition(&self, state: SessionState) {
        // send_replace updates the value even when nobody subscribes.
        self.state_tx.send_replace(state);
    }

    /// Restore a persisted session, polling up to the configured attempt
    /// cap with a fixed delay between polls. Transitions to `Authenticated`
    /// on the first non-empty result, to `Anonymous` after exhausting the
    /// cap — exactly at the cap, not earlier, not indefinitely.
    ///
    /// Cancellable: dropping this future emits no further transitions.
    pub async fn bootstrap(&self) -> Result<SessionState> {
        self.transition(SessionState::Restoring);
        info!(
            "[Session] Bootstrap: restoring session ({} attempts, {:?} apart)",
            self.config.restore_attempts, self.config.restore_interval
        );

        for attempt in 1..=self.config.restore_attempts {
            match self.credentials.restore_session().await {
                Ok(Some(principal)) => {
                    info!(
                        "[Session] Restored session for {} on attempt {}",
                        principal.username, attempt
                    );
                    let principal = self.mark_online(principal, true).await?;
                    let state = SessionState::Authenticated(principal);
                    self.transition(state.clone());
                    return Ok(state);
                }
                Ok(None) => {}
                // The credential store may simply not be up yet; an error
                // counts as a failed poll, not a hard bootstrap failure.
                Err(e) => warn!("[Session] Restore attempt {} failed: {}", attempt, e),
            }
            if attempt < self.config.restore_attempts {
                tokio::time::sleep(self.config.restore_interval).await;
            }
        }

        info!("[Session] No restorable session, continuing anonymous");
        self.transition(SessionState::Anonymous);
        Ok(SessionState::Anonymous)
    }

    /// Authenticate by email or plain handle. Flips the principal's online
    /// flag as a side effect.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<Principal> {
        let principal = self.credentials.authenticate(identifier, secret).await?;
        let principal = self.mark_online(principal, true).await?;
        info!("[Session] Logged in: {}", principal.username);
        self.transition(SessionState::Authenticated(principal.clone()));
        Ok(principal)
    }

    /// Create an account and authenticate as it. Derives the placeholder
    /// email when the draft has none and computes `age` from `birth_date`
    /// as of now; any caller-supplied age is ignored by construction.
    pub async fn signup(&self, draft: ProfileDraft) -> Result<Principal> {
        let today = Utc::now().date_naive();
        let principal = Principal {
            id: Uuid::new_v4().to_string(),
            username: draft.username.clone(),
            email: draft.email_or_placeholder(),
            role: Role::User,
            mbti: draft.mbti,
            gender: draft.gender,
            birth_date: draft.birth_date,
            age: age_on(draft.birth_date, today),
            bio: draft.bio.clone(),
            avatar_url: draft.avatar_url.clone(),
            online: true,
        };

        let account = NewAccount::new(principal, &draft);
        let principal = self.credentials.create_account(account).await?;
        info!("[Session] Signed up: {}", principal.username);
        self.transition(SessionState::Authenticated(principal.clone()));
        Ok(principal)
    }

    /// End the current session. Idempotent: without an active session this
    /// is a no-op, not an error.
    pub async fn logout(&self) -> Result<()> {
        let principal = match self.current() {
            SessionState::Authenticated(principal) => principal,
            _ => return Ok(()),
        };

        self.credentials.clear_session().await?;
        self.mark_online(principal.clone(), false).await?;
        info!("[Session] Logged out: {}", principal.username);
        self.transition(SessionState::Anonymous);
        Ok(())
    }

    /// Apply profile edits to the current principal and persist them.
    /// Recomputes `age` when the birth date changes.
    pub async fn update_profile(&self, changes: ProfileChanges) -> Result<Principal> {
        let mut principal = match self.current() {
            SessionState::Authenticated(principal) => principal,
            _ => {
                return Err(KindredError::InvalidIdentity(
                    "no active session".to_string(),
                ))
            }
        };

        if let Some(email) = changes.email {
            principal.email = email;
        }
        if let Some(mbti) = changes.mbti {
            principal.mbti = mbti;
        }
        if let Some(gender) = changes.gender {
            principal.gender = gender;
        }
        if let Some(birth_date) = changes.birth_date {
            principal.birth_date = birth_date;
            principal.age = age_on(birth_date, Utc::now().date_naive());
        }
        if let Some(bio) = changes.bio {
            principal.bio = bio;
        }
        if let Some(avatar_url) = changes.avatar_url {
            principal.avatar_url = avatar_url;
        }

        self.persist(&principal).await?;
        info!("[Session] Profile updated: {}", principal.username);
        self.transition(SessionState::Authenticated(principal.clone()));
        Ok(principal)
    }

    async fn mark_online(&self, mut principal: Principal, online: bool) -> Result<Principal> {
        principal.online = online;
        self.persist(&principal).await?;
        Ok(principal)
    }

    async fn persist(&self, principal: &Principal) -> Result<()> {
        self.store
            .put(
                PROFILES,
                &principal.id,
                principal.to_document()?,
                PutMode::Upsert,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Gender, Mbti};
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    fn draft(username: &str) -> ProfileDraft {
        ProfileDraft {
            username: username.to_string(),
            email: None,
            password: "123123".to_string(),
            mbti: Mbti::INFJ,
            gender: Gender::Female,
            birth_date: NaiveDate::from_ymd_opt(2000, 3, 4).unwrap(),
            bio: String::new(),
            avatar_url: None,
        }
    }

    fn manager(store: &Arc<MemoryStore>, attempts: u32) -> SessionManager {
        SessionManager::new(
            store.clone(),
            store.clone(),
            SessionConfig {
                restore_attempts: attempts,
                restore_interval: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn bootstrap_without_session_goes_anonymous_at_cap() {
        let store = Arc::new(MemoryStore::new());
        let sessions = manager(&store, 3);

        let state = sessions.bootstrap().await.unwrap();
        assert_eq!(state, SessionState::Anonymous);
        assert_eq!(sessions.current(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn bootstrap_restores_session_available_on_last_attempt() {
        let store = Arc::new(MemoryStore::new());
        let sessions = manager(&store, 3);
        let ana = sessions.signup(draft("ana")).await.unwrap();
        sessions.logout().await.unwrap();

        // Session becomes visible only on the third poll.
        store.seed_session(&ana.id, 2).await;
        let state = sessions.bootstrap().await.unwrap();
        assert!(matches!(state, SessionState::Authenticated(p) if p.id == ana.id));
    }

    #[tokio::test]
    async fn bootstrap_does_not_poll_past_the_cap() {
        let store = Arc::new(MemoryStore::new());
        let sessions = manager(&store, 3);
        let ana = sessions.signup(draft("ana")).await.unwrap();
        sessions.logout().await.unwrap();

        // Session would only become visible on the fourth poll.
        store.seed_session(&ana.id, 3).await;
        let state = sessions.bootstrap().await.unwrap();
        assert_eq!(state, SessionState::Anonymous);
    }

    #[tokio::test]
    async fn cancelled_bootstrap_emits_no_further_transitions() {
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            store.clone(),
            SessionConfig {
                restore_attempts: 50,
                restore_interval: Duration::from_millis(20),
            },
        ));

        let task = tokio::spawn({
            let sessions = sessions.clone();
            async move {
                let _ = sessions.bootstrap().await;
            }
        });

        // Let bootstrap start polling, then tear the owning scope down.
        tokio::time::sleep(Duration::from_millis(5)).await;
        task.abort();
        let _ = task.await;

        assert_eq!(sessions.current(), SessionState::Restoring);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sessions.current(), SessionState::Restoring);
    }

    #[tokio::test]
    async fn bootstrap_publishes_restoring_then_final_state() {
        let store = Arc::new(MemoryStore::new());
        let sessions = manager(&store, 1);
        let mut states = sessions.subscribe();

        sessions.bootstrap().await.unwrap();

        states.changed().await.unwrap();
        // watch keeps only the latest value; after bootstrap that is the
        // terminal state.
        assert_eq!(*states.borrow(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn login_matches_email_and_handle() {
        let store = Arc::new(MemoryStore::new());
        let sessions = manager(&store, 1);
        let mut d = draft("lc");
        d.email = Some("LC@ne.ai".to_string());
        sessions.signup(d).await.unwrap();
        sessions.logout().await.unwrap();

        let by_email = sessions.login("LC@ne.ai", "123123").await.unwrap();
        assert_eq!(by_email.username, "lc");
        sessions.logout().await.unwrap();

        let by_handle = sessions.login("lc", "123123").await.unwrap();
        assert_eq!(by_handle.email, "LC@ne.ai");
    }

    #[tokio::test]
    async fn login_with_wrong_secret_fails() {
        let store = Arc::new(MemoryStore::new());
        let sessions = manager(&store, 1);
        let mut d = draft("lc");
        d.email = Some("LC@ne.ai".to_string());
        sessions.signup(d).await.unwrap();
        sessions.logout().await.unwrap();

        let err = sessions.login("LC@ne.ai", "wrong").await.unwrap_err();
        assert!(matches!(err, KindredError::InvalidCredentials));
        assert_eq!(sessions.current(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn login_flips_online_flag_in_store() {
        let store = Arc::new(MemoryStore::new());
        let sessions = manager(&store, 1);
        let ana = sessions.signup(draft("ana")).await.unwrap();
        sessions.logout().await.unwrap();

        let stored = store.get(PROFILES, &ana.id).await.unwrap().unwrap();
        assert_eq!(stored["online"], serde_json::json!(false));

        sessions.login("ana", "123123").await.unwrap();
        let stored = store.get(PROFILES, &ana.id).await.unwrap().unwrap();
        assert_eq!(stored["online"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn signup_derives_placeholder_email_and_age() {
        let store = Arc::new(MemoryStore::new());
        let sessions = manager(&store, 1);

        let ana = sessions.signup(draft("ana")).await.unwrap();
        assert_eq!(ana.email, "ana@kindred.local");
        let expected = age_on(
            NaiveDate::from_ymd_opt(2000, 3, 4).unwrap(),
            Utc::now().date_naive(),
        );
        assert_eq!(ana.age, expected);
        assert!(ana.online);
    }

    #[tokio::test]
    async fn signup_rejects_taken_handle() {
        let store = Arc::new(MemoryStore::new());
        let sessions = manager(&store, 1);
        sessions.signup(draft("ana")).await.unwrap();

        let err = sessions.signup(draft("ana")).await.unwrap_err();
        assert!(matches!(err, KindredError::DuplicateIdentity(_)));
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let sessions = manager(&store, 1);

        // No active session: no-op, not an error.
        sessions.logout().await.unwrap();

        sessions.signup(draft("ana")).await.unwrap();
        sessions.logout().await.unwrap();
        assert_eq!(sessions.current(), SessionState::Anonymous);
        sessions.logout().await.unwrap();
    }

    #[tokio::test]
    async fn update_profile_recomputes_age_from_birth_date() {
        let store = Arc::new(MemoryStore::new());
        let sessions = manager(&store, 1);
        sessions.signup(draft("ana")).await.unwrap();

        let new_birth = NaiveDate::from_ymd_opt(1990, 1, 1).unwrap();
        let updated = sessions
            .update_profile(ProfileChanges {
                birth_date: Some(new_birth),
                bio: Some("hello".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(updated.age, age_on(new_birth, Utc::now().date_naive()));
        assert_eq!(updated.bio, "hello");
    }

    #[tokio::test]
    async fn update_profile_without_session_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let sessions = manager(&store, 1);

        let err = sessions
            .update_profile(ProfileChanges::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KindredError::InvalidIdentity(_)));
    }
}
