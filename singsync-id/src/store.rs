//! Token → sample store
//!
//! Decouples "submit a sample" from "start a run". Entries are inserted on submit and
//! removed when a run using them reaches a terminal state, or by the expiry sweeper.
//! Dropping the last handle of an uploaded file deletes the file.

use crate::types::SampleHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredSample {
    sample: SampleHandle,
    submitted_at: Instant,
}

/// Shared, concurrently accessible sample store
#[derive(Debug, Clone, Default)]
pub struct SampleStore {
    entries: Arc<RwLock<HashMap<String, StoredSample>>>,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sample and return its opaque token
    pub async fn insert(&self, sample: SampleHandle) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let entry = StoredSample {
            sample,
            submitted_at: Instant::now(),
        };
        self.entries.write().await.insert(token.clone(), entry);
        debug!(token = %token, "Sample stored");
        token
    }

    pub async fn get(&self, token: &str) -> Option<SampleHandle> {
        self.entries
            .read()
            .await
            .get(token)
            .map(|entry| entry.sample.clone())
    }

    /// Remove a token; returns whether it was present
    pub async fn remove(&self, token: &str) -> bool {
        let removed = self.entries.write().await.remove(token).is_some();
        if removed {
            debug!(token = %token, "Sample released");
        }
        removed
    }

    pub async fn contains(&self, token: &str) -> bool {
        self.entries.read().await.contains_key(token)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop entries older than `ttl`; returns how many were removed
    pub async fn purge_expired(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.submitted_at) < ttl);
        before - entries.len()
    }

    /// Periodically purge expired entries until `shutdown` fires
    pub fn spawn_sweeper(
        &self,
        ttl: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = store.purge_expired(ttl).await;
                        if purged > 0 {
                            info!(purged, "Expired samples removed");
                        }
                    }
                }
            }
            debug!("Sample sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SampleHandle {
        SampleHandle::from_bytes("clip.wav", vec![0u8; 4])
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let store = SampleStore::new();
        let token = store.insert(sample()).await;

        assert_eq!(token.len(), 32);
        assert!(store.get(&token).await.is_some());
        assert!(store.remove(&token).await);
        assert!(store.get(&token).await.is_none());
        assert!(!store.remove(&token).await);
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let store = SampleStore::new();
        let a = store.insert(sample()).await;
        let b = store.insert(sample()).await;
        assert_ne!(a, b);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = SampleStore::new();
        let old = store.insert(sample()).await;
        tokio::time::advance(Duration::from_secs(120)).await;
        let fresh = store.insert(sample()).await;

        let purged = store.purge_expired(Duration::from_secs(60)).await;

        assert_eq!(purged, 1);
        assert!(!store.contains(&old).await);
        assert!(store.contains(&fresh).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_until_shutdown() {
        let store = SampleStore::new();
        let token = store.insert(sample()).await;
        let shutdown = CancellationToken::new();
        let handle = store.spawn_sweeper(
            Duration::from_secs(30),
            Duration::from_secs(10),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(!store.contains(&token).await);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_removed_upload_file_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.m4a");
        std::fs::write(&path, b"audio").unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let store = SampleStore::new();
            let token = store.insert(SampleHandle::temporary_file(&path)).await;
            store.remove(&token).await;
        });

        assert!(!path.exists());
    }
}
