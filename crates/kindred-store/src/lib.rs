//! JSON-file backends for the Kindred core store traits
//!
//! Durable enough for a single-node deployment: atomic file writes, an
//! in-memory cache, and broadcast-based change notifications. Anything
//! bigger swaps in a real document service behind the same traits.

pub mod credentials;
pub mod json_store;

pub use credentials::JsonCredentialStore;
pub use json_store::{JsonDocumentStore, StoreConfig};
