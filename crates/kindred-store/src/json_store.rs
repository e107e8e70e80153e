//! JSON-based document storage
//!
//! One JSON file per collection, loaded into memory at open, persisted with
//! atomic writes. Change notifications go out over per-collection broadcast
//! channels carrying the full collection contents.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use kindred_core::error::{KindredError, Result};
use kindred_core::store::{ChangeEvent, ChangeFeed, DocumentStore, PutMode, PutOutcome};

/// Configuration for the JSON stores.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory holding one `<collection>.json` per collection.
    pub root: PathBuf,
    /// Broadcast capacity per collection feed.
    pub feed_capacity: usize,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            feed_capacity: 32,
        }
    }

    /// Ensure the storage directory exists.
    pub async fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await.map_err(io_err)?;
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> KindredError {
    KindredError::StoreUnavailable(e.to_string())
}

/// JSON-file document store.
pub struct JsonDocumentStore {
    config: StoreConfig,
    /// In-memory cache of loaded collections
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    /// Broadcast channels for each collection
    channels: RwLock<HashMap<String, broadcast::Sender<ChangeEvent>>>,
}

impl JsonDocumentStore {
    /// Open the store, loading every existing collection file.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        config.ensure_dirs().await?;

        let store = Self {
            config,
            collections: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        };
        store.load_existing().await?;

        info!(
            "[JsonStore] Opened at {:?} with {} collections",
            store.config.root,
            store.collections.read().await.len()
        );
        Ok(store)
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.config.root.join(format!("{}.json", collection))
    }

    async fn load_existing(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.config.root).await.map_err(io_err)?;
        let mut collections = self.collections.write().await;

        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = fs::read_to_string(&path).await.map_err(io_err)?;
            match serde_json::from_str::<BTreeMap<String, Value>>(&content) {
                Ok(docs) => {
                    collections.insert(name.to_string(), docs);
                }
                Err(e) => {
                    warn!("[JsonStore] Skipping unreadable collection {:?}: {}", path, e);
                }
            }
        }
        Ok(())
    }

    /// Persist a collection atomically: write to a temp file, then rename.
    async fn persist(&self, collection: &str, docs: &BTreeMap<String, Value>) -> Result<()> {
        let path = self.collection_path(collection);
        let temp_path = path.with_extension("tmp");

        let json = serde_json::to_string_pretty(docs)?;
        fs::write(&temp_path, json).await.map_err(io_err)?;
        fs::rename(&temp_path, &path).await.map_err(io_err)?;
        Ok(())
    }

    /// Get broadcast channel for a collection.
    async fn get_channel(&self, collection: &str) -> broadcast::Sender<ChangeEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(self.config.feed_capacity).0)
            .clone()
    }

    async fn notify(&self, collection: &str, documents: BTreeMap<String, Value>) {
        let channel = self.get_channel(collection).await;
        let _ = channel.send(ChangeEvent {
            collection: collection.to_string(),
            documents,
        });
    }
}

#[async_trait]
impl DocumentStore for JsonDocumentStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
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
        // Conflict check, disk write, and cache commit all happen under one
        // write lock; the cache only changes once the file write succeeded.
        let contents = {
            let mut collections = self.collections.write().await;
            let docs = collections.entry(collection.to_string()).or_default();
            if mode == PutMode::CreateOnly && docs.contains_key(key) {
                return Ok(PutOutcome::Conflict);
            }

            let mut updated = docs.clone();
            updated.insert(key.to_string(), document);
            self.persist(collection, &updated).await?;
            *docs = updated.clone();
            updated
        };

        self.notify(collection, contents).await;
        Ok(PutOutcome::Written)
    }

    async fn snapshot(&self, collection: &str) -> Result<BTreeMap<String, Value>> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).cloned().unwrap_or_default())
    }

    async fn subscribe(&self, collection: &str) -> Result<ChangeFeed> {
        let channel = self.get_channel(collection).await;
        Ok(ChangeFeed::new(channel.subscribe()))
    }
}
