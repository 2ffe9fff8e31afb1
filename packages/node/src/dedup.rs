//! Query-id deduplication.
//!
//! Every federated query carries a `query_id` shared by all hops. A pod
//! registers the id before doing any work; a second arrival of the same id
//! (a cycle in the link graph, or a diamond) is refused. Entries live for a
//! fixed TTL and are removed by [`run_purge_loop`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::storage::{Storage, StorageError};

/// Longest time an entry is kept, whatever TTL is configured.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Clone)]
pub struct QueryDedupCache {
    storage: Arc<dyn Storage>,
    ttl: chrono::Duration,
}

impl QueryDedupCache {
    /// `ttl` is capped at [`MAX_TTL`].
    pub fn new(storage: Arc<dyn Storage>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl.min(MAX_TTL)).unwrap_or(chrono::Duration::zero());
        Self { storage, ttl }
    }

    pub async fn exists(&self, query_id: Uuid) -> Result<bool, StorageError> {
        self.storage.query_marker_exists(query_id, Utc::now()).await
    }

    /// Register `query_id` as seen from `origin`. Returns `false` if it is
    /// already registered. Of concurrent calls for one id exactly one wins.
    pub async fn set(&self, query_id: Uuid, origin: &str) -> Result<bool, StorageError> {
        let expires_at = Utc::now() + self.ttl;
        self.storage
            .insert_query_marker(query_id, origin, expires_at)
            .await
    }

    pub async fn delete(&self, query_id: Uuid) -> Result<bool, StorageError> {
        self.storage.delete_query_marker(query_id).await
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn purge(&self) -> Result<u64, StorageError> {
        self.storage.purge_query_markers(Utc::now()).await
    }
}

/// Sweep expired entries every `interval` until the task is aborted.
pub async fn run_purge_loop(cache: QueryDedupCache, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match cache.purge().await {
            Ok(0) => {}
            Ok(n) => tracing::debug!("dedup: purged {n} expired query ids"),
            Err(e) => tracing::warn!("dedup: purge failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{memory::MemoryStorage, sqlite::SqliteStorage};

    fn cache(ttl: Duration) -> QueryDedupCache {
        QueryDedupCache::new(Arc::new(MemoryStorage::new()), ttl)
    }

    #[tokio::test]
    async fn first_set_wins() {
        let cache = cache(Duration::from_secs(60));
        let id = Uuid::now_v7();
        assert!(!cache.exists(id).await.unwrap());
        assert!(cache.set(id, "member:a").await.unwrap());
        assert!(!cache.set(id, "member:b").await.unwrap());
        assert!(cache.exists(id).await.unwrap());

        assert!(cache.delete(id).await.unwrap());
        assert!(!cache.delete(id).await.unwrap());
        assert!(cache.set(id, "member:b").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_sets_have_one_winner() {
        let cache = cache(Duration::from_secs(60));
        let id = Uuid::now_v7();
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let cache = cache.clone();
            tasks.spawn(async move { cache.set(id, &format!("caller-{i}")).await.unwrap() });
        }
        let mut winners = 0;
        while let Some(won) = tasks.join_next().await {
            if won.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_purged_and_reusable() {
        let cache = cache(Duration::ZERO);
        let id = Uuid::now_v7();
        assert!(cache.set(id, "x").await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!cache.exists(id).await.unwrap());
        assert_eq!(cache.purge().await.unwrap(), 1);
        assert!(cache.set(id, "x").await.unwrap());
    }

    #[tokio::test]
    async fn oversized_ttl_is_capped() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let cache = QueryDedupCache::new(storage, Duration::MAX);
        assert_eq!(cache.ttl, chrono::Duration::from_std(MAX_TTL).unwrap());
        let id = Uuid::now_v7();
        assert!(cache.set(id, "x").await.unwrap());
        assert!(cache.exists(id).await.unwrap());
        assert_eq!(cache.purge().await.unwrap(), 0);
        assert!(!cache.set(id, "y").await.unwrap());
    }
}
