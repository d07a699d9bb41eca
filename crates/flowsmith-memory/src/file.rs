//! File-backed loop memory
//!
//! Each session gets a directory under the root holding three artifacts:
//! `prd.json`, `progress.txt` and `checkpoint.json`. Every artifact is
//! replaced atomically (temp file in the same directory, sync, rename), so
//! a reader sees either the old or the new content.

use async_trait::async_trait;
use flowsmith_core::{FlowError, Result};
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::snapshot::{
    normalize_session_id, LoopMemorySnapshot, CHECKPOINT_FILE, PROGRESS_FILE, REQUIREMENTS_FILE,
};
use crate::LoopMemoryStore;

/// Durable loop memory rooted at a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a session's artifacts
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(normalize_session_id(session_id))
    }

    fn check_root(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(FlowError::InvalidInput(
                "loop memory root is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read an artifact; `None` when the file does not exist
async fn read_artifact(dir: &Path, artifact: &str, session: &str) -> Result<Option<String>> {
    match fs::read_to_string(dir.join(artifact)).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(load_error(session, artifact, e)),
    }
}

/// Parse a JSON artifact; blank files count as absent
fn parse_artifact<T: DeserializeOwned>(
    text: Option<String>,
    artifact: &str,
    session: &str,
) -> Result<Option<T>> {
    match text {
        Some(text) if !text.trim().is_empty() => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| load_error(session, artifact, e)),
        _ => Ok(None),
    }
}

fn load_error(session: &str, artifact: &str, err: impl std::fmt::Display) -> FlowError {
    FlowError::MemoryLoad {
        session: session.to_string(),
        artifact: artifact.to_string(),
        message: err.to_string(),
    }
}

fn save_error(session: &str, err: impl std::fmt::Display) -> FlowError {
    FlowError::MemorySave {
        session: session.to_string(),
        message: err.to_string(),
    }
}

fn pretty_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Replace `path` with `data` via a temp file in the same directory
async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).await?;
    let tmp_path = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));

    let result = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

#[async_trait]
impl LoopMemoryStore for FileStore {
    async fn load(&self, session_id: &str) -> Result<(LoopMemorySnapshot, bool)> {
        self.check_root()?;
        let session = normalize_session_id(session_id);
        let dir = self.root.join(&session);

        match fs::metadata(&dir).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok((LoopMemorySnapshot::new(session), false));
            }
            Err(e) => return Err(load_error(&session, "session directory", e)),
        }

        let mut snapshot = LoopMemorySnapshot::new(session.clone());

        let text = read_artifact(&dir, REQUIREMENTS_FILE, &session).await?;
        if let Some(requirements) = parse_artifact(text, REQUIREMENTS_FILE, &session)? {
            snapshot.requirements = requirements;
        }

        if let Some(progress) = read_artifact(&dir, PROGRESS_FILE, &session).await? {
            snapshot.progress = progress;
        }

        let text = read_artifact(&dir, CHECKPOINT_FILE, &session).await?;
        if let Some(checkpoint) = parse_artifact(text, CHECKPOINT_FILE, &session)? {
            snapshot.checkpoint = checkpoint;
        }

        debug!(
            "Loaded loop memory for {} (iteration {})",
            session, snapshot.checkpoint.iteration
        );
        Ok((snapshot, true))
    }

    async fn save(&self, session_id: &str, snapshot: &LoopMemorySnapshot) -> Result<()> {
        self.check_root()?;
        let session = normalize_session_id(session_id);
        let dir = self.root.join(&session);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| save_error(&session, e))?;

        let requirements = pretty_json(&snapshot.requirements)?;
        write_atomic(&dir.join(REQUIREMENTS_FILE), &requirements)
            .await
            .map_err(|e| save_error(&session, format!("{}: {}", REQUIREMENTS_FILE, e)))?;

        write_atomic(&dir.join(PROGRESS_FILE), snapshot.progress.as_bytes())
            .await
            .map_err(|e| save_error(&session, format!("{}: {}", PROGRESS_FILE, e)))?;

        let checkpoint = pretty_json(&snapshot.checkpoint)?;
        write_atomic(&dir.join(CHECKPOINT_FILE), &checkpoint)
            .await
            .map_err(|e| save_error(&session, format!("{}: {}", CHECKPOINT_FILE, e)))?;

        debug!("Saved loop memory for {} to {:?}", session, dir);
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
