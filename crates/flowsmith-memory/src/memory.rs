//! Process-lifetime loop memory

use async_trait::async_trait;
use flowsmith_core::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::snapshot::{normalize_session_id, LoopMemorySnapshot};
use crate::LoopMemoryStore;

/// Loop memory kept in a map; lost when the process exits
#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<String, LoopMemorySnapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoopMemoryStore for InMemoryStore {
    async fn load(&self, session_id: &str) -> Result<(LoopMemorySnapshot, bool)> {
        let key = normalize_session_id(session_id);
        let sessions = self.sessions.read().await;
        match sessions.get(&key) {
            Some(snapshot) => Ok((snapshot.clone(), true)),
            None => Ok((LoopMemorySnapshot::new(key), false)),
        }
    }

    async fn save(&self, session_id: &str, snapshot: &LoopMemorySnapshot) -> Result<()> {
        let key = normalize_session_id(session_id);
        let mut stored = snapshot.clone();
        stored.session_id = key.clone();
        self.sessions.write().await.insert(key, stored);
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_missing_returns_default() {
        let store = InMemoryStore::new();
        let (snapshot, found) = store.load("Session A").await.unwrap();
        assert!(!found);
        assert_eq!(snapshot.session_id, "session-a");
        assert!(snapshot.progress.is_empty());
    }

    #[tokio::test]
    async fn test_save_is_copied() {
        let store = InMemoryStore::new();
        let mut snapshot = LoopMemorySnapshot::new("s");
        snapshot.checkpoint.iteration = 3;
        store.save("s", &snapshot).await.unwrap();

        snapshot.checkpoint.iteration = 9;
        let (loaded, found) = store.load("S").await.unwrap();
        assert!(found);
        assert_eq!(loaded.checkpoint.iteration, 3);
    }

    #[tokio::test]
    async fn test_append_progress() {
        let store = InMemoryStore::new();
        store.append_progress("s", "one").await.unwrap();
        store.append_progress("s", "two").await.unwrap();
        let (loaded, _) = store.load("s").await.unwrap();
        assert_eq!(loaded.progress, "one\ntwo\n");
        assert!(!store.is_durable());
        assert_eq!(store.name(), "memory");
    }
}
