//! The installed-version descriptor, `<install_dir>/version.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::{UpdateError, UpdateResult};
use crate::update::Version;

pub const DESCRIPTOR_FILE: &str = "version.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub version: Version,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl VersionDescriptor {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            updated_at: Utc::now(),
            previous_version: None,
            notes: None,
        }
    }

    /// Descriptor for `next`, recording `self` as the previous version.
    #[must_use]
    pub fn advance(&self, next: Version, notes: Option<String>) -> Self {
        Self {
            version: next,
            updated_at: Utc::now(),
            previous_version: Some(self.version.clone()),
            notes,
        }
    }

    #[must_use]
    pub fn path(install_dir: &Path) -> PathBuf {
        install_dir.join(DESCRIPTOR_FILE)
    }

    /// Read the descriptor, or `None` if it does not exist.
    pub async fn read(install_dir: &Path) -> UpdateResult<Option<Self>> {
        let path = Self::path(install_dir);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(UpdateError::io("read version descriptor", path, e)),
        };
        serde_json::from_str(&content).map(Some).map_err(|e| {
            UpdateError::io(
                "parse version descriptor",
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    /// Read the descriptor, creating it with `fallback` when missing.
    pub async fn read_or_init(install_dir: &Path, fallback: &Version) -> UpdateResult<Self> {
        if let Some(existing) = Self::read(install_dir).await? {
            return Ok(existing);
        }
        info!("No version descriptor found, recording {}", fallback);
        let descriptor = Self::new(fallback.clone());
        descriptor.write(install_dir).await?;
        Ok(descriptor)
    }

    pub async fn write(&self, install_dir: &Path) -> UpdateResult<()> {
        let path = Self::path(install_dir);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| UpdateError::io("serialize version descriptor", &path, std::io::Error::other(e)))?;
        crate::utils::fs::atomic_write(&path, &json)
            .await
            .map_err(|e| UpdateError::io("write version descriptor", &path, e))?;
        debug!("Wrote version descriptor for {}", self.version);
        Ok(())
    }
}
