//! # flowsmith-memory
//!
//! Per-session loop memory for the autonomous loop.
//!
//! This crate provides:
//! - [`LoopMemorySnapshot`] / [`LoopCheckpoint`] records
//! - The [`LoopMemoryStore`] trait
//! - An in-process store (non-durable) and a file-backed store with atomic replace
//! - Session id normalization

#![allow(dead_code)]

mod file;
mod memory;
mod snapshot;

pub use file::FileStore;
pub use memory::InMemoryStore;
pub use snapshot::{
    append_progress_line, normalize_session_id, LoopCheckpoint, LoopMemorySnapshot,
    CHECKPOINT_FILE, DEFAULT_SESSION_ID, PROGRESS_FILE, REQUIREMENTS_FILE,
};

use async_trait::async_trait;
use flowsmith_core::Result;

/// Storage for loop memory snapshots keyed by session
#[async_trait]
pub trait LoopMemoryStore: Send + Sync {
    /// Load a session; returns a default snapshot and `false` when nothing was stored
    async fn load(&self, session_id: &str) -> Result<(LoopMemorySnapshot, bool)>;

    async fn save(&self, session_id: &str, snapshot: &LoopMemorySnapshot) -> Result<()>;

    /// Append one line to the session's progress log
    async fn append_progress(&self, session_id: &str, line: &str) -> Result<()> {
        let (mut snapshot, _) = self.load(session_id).await?;
        append_progress_line(&mut snapshot.progress, line);
        self.save(session_id, &snapshot).await
    }

    /// Whether snapshots survive the process
    fn is_durable(&self) -> bool;

    fn name(&self) -> &'static str;
}
