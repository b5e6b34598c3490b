//! Append-only log of update outcomes.
//!
//! One JSON object per line in `<state_dir>/update_history.jsonl`. Every append
//! is followed by an fsync. Lines that fail to parse are skipped when listing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::core::{UpdateError, UpdateResult};
use crate::update::Version;

pub const HISTORY_FILE: &str = "update_history.jsonl";

/// How an update session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Applied,
    Failed,
    RolledBack,
}

impl std::fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateHistoryEntry {
    /// Target version, or the running version when no candidate was found.
    pub version: Version,
    pub timestamp: DateTime<Utc>,
    pub outcome: UpdateOutcome,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl UpdateHistoryEntry {
    pub fn new(version: Version, outcome: UpdateOutcome, detail: impl Into<String>) -> Self {
        Self {
            version,
            timestamp: Utc::now(),
            outcome,
            detail: detail.into(),
            session_id: None,
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// JSON-lines history store.
#[derive(Debug, Clone)]
pub struct UpdateHistoryStore {
    path: PathBuf,
}

impl UpdateHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
        }
    }

    /// Store at `<state_dir>/update_history.jsonl`.
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(HISTORY_FILE))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it to disk.
    pub async fn append(&self, entry: &UpdateHistoryEntry) -> UpdateResult<()> {
        let io_error = |e| UpdateError::io("append update history", &self.path, e);

        let mut line = serde_json::to_string(entry).map_err(|e| io_error(std::io::Error::other(e)))?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_error)?;
        file.write_all(line.as_bytes()).await.map_err(io_error)?;
        file.sync_all().await.map_err(io_error)?;

        debug!("Recorded {} for {} in update history", entry.outcome, entry.version);
        Ok(())
    }

    /// All entries in file order. A missing file is an empty history.
    pub async fn list(&self) -> UpdateResult<Vec<UpdateHistoryEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UpdateError::io("read update history", &self.path, e)),
        };

        let mut entries = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    line = number + 1,
                    "Skipping unreadable update history entry in {}: {}",
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_list_in_order() {
        let temp = TempDir::new().unwrap();
        let store = UpdateHistoryStore::in_state_dir(&temp.path().join("state"));
        assert!(store.list().await.unwrap().is_empty());

        let first = UpdateHistoryEntry::new(Version::parse("1.0.1").unwrap(), UpdateOutcome::Applied, "ok")
            .with_session("s-1");
        let second =
            UpdateHistoryEntry::new(Version::parse("1.1.0").unwrap(), UpdateOutcome::RolledBack, "disk full");
        store.append(&first).await.unwrap();
        store.append(&second).await.unwrap();

        let entries = store.list().await.unwrap();
        assert_eq!(entries, vec![first, second]);
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_lines() {
        let temp = TempDir::new().unwrap();
        let store = UpdateHistoryStore::in_state_dir(temp.path());
        let entry = UpdateHistoryEntry::new(Version::parse("2.0.0").unwrap(), UpdateOutcome::Failed, "checksum");
        store.append(&entry).await.unwrap();

        let mut raw = std::fs::read_to_string(store.path()).unwrap();
        raw.push_str("{not json\n\n");
        std::fs::write(store.path(), raw).unwrap();
        store.append(&entry).await.unwrap();

        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&UpdateOutcome::RolledBack).unwrap();
        assert_eq!(json, "\"rolled_back\"");
        assert_eq!(UpdateOutcome::RolledBack.to_string(), "rolled_back");
    }
}
