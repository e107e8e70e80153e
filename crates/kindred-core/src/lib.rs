//! Kindred core
//!
//! The data-synchronization and identity layer of the Kindred matching
//! app: session bootstrap against an eventually-available credential
//! store, a live filtered directory of candidate profiles, and
//! deterministic conversation identity for messaging. Presentation and
//! transport live elsewhere and consume this crate.

pub mod conversation;
pub mod directory;
pub mod error;
pub mod identity;
pub mod models;
pub mod session;
pub mod store;

pub use conversation::ConversationResolver;
pub use directory::{apply_filters, DirectoryConfig, DirectoryEvent, DirectoryFeed, DirectorySynchronizer};
pub use error::{KindredError, Result};
pub use identity::conversation_key;
pub use models::{
    Conversation, DirectorySnapshot, FilterCriteria, Gender, Mbti, MbtiGroup, Principal,
    ProfileDraft, Role,
};
pub use session::{ProfileChanges, SessionConfig, SessionManager, SessionState};
pub use store::{
    ChangeEvent, ChangeFeed, CredentialStore, DocumentStore, MemoryStore, NewAccount, PutMode,
    PutOutcome,
};
