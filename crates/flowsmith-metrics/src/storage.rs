//! Append-only telemetry log (one JSON object per line)

use flowsmith_core::Result;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::report::SessionTelemetry;

/// JSONL file of session telemetry, consumed by effectiveness reports
#[derive(Debug, Clone)]
pub struct TelemetryLog {
    path: PathBuf,
}

impl TelemetryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &SessionTelemetry) -> Result<()> {
        let line = serde_json::to_string(entry)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;

        debug!("Appended telemetry for {} to {:?}", entry.session_id, self.path);
        Ok(())
    }

    /// Every readable entry; malformed lines are skipped
    pub async fn load_all(&self) -> Result<Vec<SessionTelemetry>> {
        if !fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).await?;
        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionTelemetry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => debug!("Skipping telemetry line: {}", e),
            }
        }
        Ok(entries)
    }
}
