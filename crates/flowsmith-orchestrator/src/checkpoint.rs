//! In-memory checkpoint bytes for paused multi-agent runs

use std::collections::HashMap;
use std::sync::Mutex;

/// Opaque checkpoint payloads keyed by checkpoint id
///
/// Stored and returned values are copies; callers never share a buffer
/// with the store.
#[derive(Default)]
pub struct CheckpointStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, checkpoint_id: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(checkpoint_id).cloned()
    }

    pub fn set(&self, checkpoint_id: &str, data: &[u8]) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(checkpoint_id.to_string(), data.to_vec());
    }

    /// Returns whether an entry was removed
    pub fn delete(&self, checkpoint_id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(checkpoint_id).is_some()
    }
}
