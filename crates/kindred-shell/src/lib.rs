//! Kindred application shell
//!
//! Stands in for the UI tier: boots the session, follows the live
//! directory, and logs what a browse screen would render. Everything of
//! substance lives in `kindred-core`.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use kindred_core::{
    apply_filters, DirectoryConfig, DirectoryEvent, DirectorySynchronizer, FilterCriteria,
    SessionConfig, SessionManager, SessionState,
};
use kindred_store::{JsonCredentialStore, JsonDocumentStore, StoreConfig};

pub async fn run() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // Already set, ignore
    }

    info!("=== Kindred ===");

    let root = std::env::var("KINDRED_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("kindred_data"));
    info!("Storage directory: {:?}", root);

    let store = Arc::new(JsonDocumentStore::open(StoreConfig::new(&root)).await?);
    let credentials = Arc::new(JsonCredentialStore::new(store.clone(), &root));

    let sessions = SessionManager::new(credentials, store.clone(), SessionConfig::default());
    let state = sessions.bootstrap().await?;
    let viewer_id = match &state {
        SessionState::Authenticated(principal) => {
            info!("Session restored for {}", principal.username);
            principal.id.clone()
        }
        _ => {
            info!("No restorable session; browsing anonymously");
            String::new()
        }
    };

    let directory = Arc::new(DirectorySynchronizer::new(
        store.clone(),
        DirectoryConfig::default(),
    ));
    let mut feed = directory.subscribe();
    let criteria = FilterCriteria::default();

    loop {
        tokio::select! {
            event = feed.next() => {
                match event {
                    Some(DirectoryEvent::Snapshot(snapshot)) => {
                        let candidates = apply_filters(&snapshot, &criteria, &viewer_id);
                        info!(
                            "Directory update: {} profiles, {} browsable candidates",
                            snapshot.len(),
                            candidates.len()
                        );
                    }
                    Some(DirectoryEvent::Unavailable) => {
                        warn!("Directory feed unavailable; shutting down");
                        break;
                    }
                    None => {
                        warn!("Directory feed closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                sessions.logout().await?;
                break;
            }
        }
    }

    Ok(())
}
