//! Directory Synchronizer
//!
//! Maintains a live in-memory mirror of the profiles collection and fans it
//! out to any number of subscribers over a single backing-store
//! subscription. The backing subscription is established lazily on the
//! first subscriber and released when the last feed is dropped, so idle
//! consumers never leak a store-side listener.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::{DirectorySnapshot, FilterCriteria, Principal};
use crate::store::{DocumentStore, PROFILES};

/// Directory feed item.
#[derive(Debug, Clone)]
pub enum DirectoryEvent {
    /// A full replacement snapshot. Supersedes every previous one.
    Snapshot(DirectorySnapshot),
    /// Resubscription attempts are exhausted; the feed ends after this.
    Unavailable,
}

/// Resubscription policy and fan-out sizing.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Consecutive failed resubscription attempts before giving up.
    pub resubscribe_attempts: u32,
    pub resubscribe_delay: Duration,
    pub feed_capacity: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            resubscribe_attempts: 5,
            resubscribe_delay: Duration::from_secs(1),
            feed_capacity: 32,
        }
    }
}

struct Inner {
    subscribers: usize,
    fan_out: Option<broadcast::Sender<DirectoryEvent>>,
    task: Option<JoinHandle<()>>,
}

/// Live mirror of all registered profiles.
pub struct DirectorySynchronizer {
    store: Arc<dyn DocumentStore>,
    config: DirectoryConfig,
    /// Swapped atomically per change event; readers hold the old snapshot
    /// until they drop their Arc.
    snapshot: RwLock<Arc<DirectorySnapshot>>,
    inner: Mutex<Inner>,
}

/// A live subscription to the directory. Dropping the feed unsubscribes;
/// dropping the last one releases the backing-store listener.
pub struct DirectoryFeed {
    rx: broadcast::Receiver<DirectoryEvent>,
    _guard: SubscriberGuard,
}

impl DirectoryFeed {
    /// Next directory event, or `None` once the feed has ended. Lagged
    /// snapshots are skipped: only the most recent one matters.
    pub async fn next(&mut self) -> Option<DirectoryEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("[Directory] Feed lagged, skipped {} snapshots", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct SubscriberGuard {
    sync: Arc<DirectorySynchronizer>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let mut inner = self.sync.inner.lock();
        inner.subscribers = inner.subscribers.saturating_sub(1);
        if inner.subscribers == 0 {
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            inner.fan_out = None;
            debug!("[Directory] Last subscriber gone, backing subscription released");
        }
    }
}

impl DirectorySynchronizer {
    pub fn new(store: Arc<dyn DocumentStore>, config: DirectoryConfig) -> Self {
        Self {
            store,
            config,
            snapshot: RwLock::new(Arc::new(DirectorySnapshot::new())),
            inner: Mutex::new(Inner {
                subscribers: 0,
                fan_out: None,
                task: None,
            }),
        }
    }

    /// Subscribe to live directory snapshots. All feeds share one backing
    /// store subscription; the sync task starts with the first feed and the
    /// first event it delivers is the seeded current snapshot.
    pub fn subscribe(self: &Arc<Self>) -> DirectoryFeed {
        let mut inner = self.inner.lock();
        inner.subscribers += 1;

        let running = matches!(&inner.task, Some(task) if !task.is_finished());
        let existing = if running { inner.fan_out.clone() } else { None };
        let tx = match existing {
            Some(tx) => tx,
            None => {
                let (tx, _) = broadcast::channel(self.config.feed_capacity);
                let sync = Arc::clone(self);
                let task_tx = tx.clone();
                inner.task = Some(tokio::spawn(async move {
                    sync.run(task_tx).await;
                }));
                inner.fan_out = Some(tx.clone());
                info!("[Directory] Backing subscription established");
                tx
            }
        };

        DirectoryFeed {
            rx: tx.subscribe(),
            _guard: SubscriberGuard {
                sync: Arc::clone(self),
            },
        }
    }

    /// The retained snapshot as of the most recent change notification.
    pub async fn current(&self) -> Arc<DirectorySnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Sync loop: subscribe, seed, mirror change events. A lapsed or failed
    /// subscription is transient; it is re-established up to the configured
    /// cap of consecutive failures before the feed surfaces `Unavailable`.
    async fn run(self: Arc<Self>, tx: broadcast::Sender<DirectoryEvent>) {
        let mut failures = 0u32;
        loop {
            match self.store.subscribe(PROFILES).await {
                Ok(mut feed) => {
                    failures = 0;

                    // Seed so early subscribers see the current population
                    // before the first write lands.
                    match self.store.snapshot(PROFILES).await {
                        Ok(docs) => {
                            let snapshot = parse_snapshot(docs);
                            self.install(snapshot, &tx).await;
                        }
                        Err(e) => {
                            warn!("[Directory] Seed snapshot failed: {}", e);
                        }
                    }

                    loop {
                        match feed.next().await {
                            Ok(event) => {
                                let snapshot = parse_snapshot(event.documents);
                                self.install(snapshot, &tx).await;
                            }
                            Err(e) => {
                                warn!("[Directory] Subscription lapsed: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("[Directory] Subscribe failed: {}", e);
                }
            }

            failures += 1;
            if failures >= self.config.resubscribe_attempts {
                error!(
                    "[Directory] Giving up after {} failed resubscription attempts",
                    failures
                );
                let _ = tx.send(DirectoryEvent::Unavailable);
                // Release the retained sender so receivers drain the
                // buffered Unavailable and then observe Closed; the feed
                // must end, not pend forever.
                let mut inner = self.inner.lock();
                inner.fan_out = None;
                inner.task = None;
                return;
            }
            tokio::time::sleep(self.config.resubscribe_delay).await;
        }
    }

    async fn install(&self, snapshot: DirectorySnapshot, tx: &broadcast::Sender<DirectoryEvent>) {
        *self.snapshot.write().await = Arc::new(snapshot.clone());
        let _ = tx.send(DirectoryEvent::Snapshot(snapshot));
    }
}

fn parse_snapshot(docs: std::collections::BTreeMap<String, serde_json::Value>) -> DirectorySnapshot {
    let mut snapshot = DirectorySnapshot::new();
    for (key, doc) in docs {
        match Principal::from_document(doc) {
            Ok(principal) => {
                snapshot.insert(key, principal);
            }
            // One bad profile must not poison the feed.
            Err(e) => warn!("[Directory] Skipping malformed profile {}: {}", key, e),
        }
    }
    snapshot
}

/// Filter a snapshot for a viewer. Pure: no I/O, recomputed fully per
/// snapshot. The viewer's own profile and every admin are excluded
/// unconditionally; admins are never browsable. Ordering is the snapshot's
/// own (stable within one snapshot).
pub fn apply_filters(
    snapshot: &DirectorySnapshot,
    criteria: &FilterCriteria,
    viewer_id: &str,
) -> Vec<Principal> {
    snapshot
        .values()
        .filter(|p| p.id != viewer_id && !p.is_admin())
        .filter(|p| criteria.matches(p))
        .cloned()
        .collect()
}
