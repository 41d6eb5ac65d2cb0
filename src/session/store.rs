//! Dataset session registry.
//!
//! The map itself is the only process-wide shared structure. Each session sits
//! behind its own `RwLock`, so mutations on one session never wait on another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::DatasetSession;

pub type SessionId = Uuid;

/// Shared, individually locked session.
pub type SessionHandle = Arc<RwLock<DatasetSession>>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: DatasetSession) -> SessionHandle;

    /// Look up a session and mark it as accessed.
    async fn get(&self, id: SessionId) -> Option<SessionHandle>;

    async fn remove(&self, id: SessionId) -> bool;

    async fn ids(&self) -> Vec<SessionId>;

    /// Remove sessions not accessed within `ttl` of `now`. Returns the removed ids.
    async fn evict_idle(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<SessionId>;
}

struct StoreEntry {
    handle: SessionHandle,
    last_accessed: DateTime<Utc>,
}

/// Process-memory store. Sessions are lost on restart.
#[derive(Default)]
pub struct InMemorySessionStore {
    entries: RwLock<HashMap<SessionId, StoreEntry>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn last_accessed(&self, id: SessionId) -> Option<DateTime<Utc>> {
        self.entries.read().await.get(&id).map(|e| e.last_accessed)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: DatasetSession) -> SessionHandle {
        let id = session.id;
        let handle = Arc::new(RwLock::new(session));
        self.entries.write().await.insert(
            id,
            StoreEntry {
                handle: handle.clone(),
                last_accessed: Utc::now(),
            },
        );
        handle
    }

    async fn get(&self, id: SessionId) -> Option<SessionHandle> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id)?;
        entry.last_accessed = Utc::now();
        Some(entry.handle.clone())
    }

    async fn remove(&self, id: SessionId) -> bool {
        self.entries.write().await.remove(&id).is_some()
    }

    async fn ids(&self) -> Vec<SessionId> {
        self.entries.read().await.keys().copied().collect()
    }

    async fn evict_idle(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<SessionId> {
        let ttl =
            chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let mut entries = self.entries.write().await;
        let stale: Vec<SessionId> = entries
            .iter()
            .filter(|(_, e)| now.signed_duration_since(e.last_accessed) > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            entries.remove(id);
            info!(session_id = %id, "evicted idle session");
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;

    fn session() -> DatasetSession {
        DatasetSession::new(
            Dataset {
                columns: vec!["text".into()],
                rows: vec![vec!["a".into()]],
            },
            0,
        )
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let store = InMemorySessionStore::new();
        let s = session();
        let id = s.id;
        store.insert(s).await;

        assert!(store.get(id).await.is_some());
        assert!(store.get(Uuid::new_v4()).await.is_none());
        assert_eq!(store.ids().await, vec![id]);
        assert!(store.remove(id).await);
        assert!(!store.remove(id).await);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn evict_idle_respects_ttl() {
        let store = InMemorySessionStore::new();
        let first = session();
        let first_id = first.id;
        store.insert(first).await;
        let second = session();
        let second_id = second.id;
        store.insert(second).await;

        assert!(store
            .evict_idle(Duration::from_secs(60), Utc::now())
            .await
            .is_empty());

        let later = store.last_accessed(second_id).await.unwrap() + chrono::Duration::seconds(120);
        store.get(first_id).await;
        let mut evicted = store.evict_idle(Duration::from_secs(60), later).await;
        evicted.sort();
        let mut expected = vec![first_id, second_id];
        expected.sort();
        assert_eq!(evicted, expected);
        assert_eq!(store.len().await, 0);
    }
}
