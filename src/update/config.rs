//! Settings for the `[updates]` section of the global configuration.
//!
//! ```toml
//! [updates]
//! auto_check = true
//! check_frequency_hours = 24
//! backup_enabled = true
//! verify_checksum = true
//! allow_prereleases = false
//! update_server_url = "https://api.github.com/repos/arcpress/arcpress/releases"
//! dismissed_versions = ["1.3.0"]
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, PathBuf};

use crate::core::{UpdateError, UpdateResult};
use crate::update::Version;

pub const DEFAULT_UPDATE_SERVER_URL: &str = "https://api.github.com/repos/arcpress/arcpress/releases";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Check automatically when the application starts and a check is due.
    #[serde(default = "default_true")]
    pub auto_check: bool,

    /// Start downloading as soon as a candidate is found. Only takes effect
    /// together with `auto_install`.
    #[serde(default)]
    pub auto_download: bool,

    #[serde(default)]
    pub auto_install: bool,

    #[serde(default = "default_check_frequency_hours")]
    pub check_frequency_hours: u32,

    #[serde(default = "default_true")]
    pub backup_enabled: bool,

    /// Verify the artifact's SHA-256 before applying it.
    #[serde(default = "default_true", alias = "verify_signatures")]
    pub verify_checksum: bool,

    #[serde(default)]
    pub allow_prereleases: bool,

    #[serde(default = "default_update_server_url")]
    pub update_server_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,

    /// Versions the user chose to skip.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dismissed_versions: Vec<String>,

    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,

    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Extra attempts after a transport failure while fetching the feed.
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: usize,

    /// Paths every artifact must contain.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_paths: Vec<String>,

    /// Install-relative files or directories always captured in a backup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_paths: Vec<PathBuf>,
}

const fn default_true() -> bool {
    true
}

const fn default_check_frequency_hours() -> u32 {
    24
}

fn default_update_server_url() -> String {
    DEFAULT_UPDATE_SERVER_URL.to_string()
}

const fn default_check_timeout_secs() -> u64 {
    30
}

const fn default_download_timeout_secs() -> u64 {
    300
}

const fn default_fetch_retries() -> usize {
    2
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            auto_check: true,
            auto_download: false,
            auto_install: false,
            check_frequency_hours: default_check_frequency_hours(),
            backup_enabled: true,
            verify_checksum: true,
            allow_prereleases: false,
            update_server_url: default_update_server_url(),
            last_check: None,
            dismissed_versions: Vec::new(),
            check_timeout_secs: default_check_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
            fetch_retries: default_fetch_retries(),
            required_paths: Vec::new(),
            backup_paths: Vec::new(),
        }
    }
}

impl UpdateConfig {
    /// Reject settings the engine cannot work with.
    pub fn validate(&self) -> UpdateResult<()> {
        let config_error = |message: String| Err(UpdateError::Config {
            message,
        });

        if self.check_frequency_hours < 1 {
            return config_error("check_frequency_hours must be at least 1".to_string());
        }
        if self.update_server_url.trim().is_empty() {
            return config_error("update_server_url must not be empty".to_string());
        }
        if self.check_timeout_secs == 0 || self.download_timeout_secs == 0 {
            return config_error("timeouts must be at least one second".to_string());
        }
        if let Some(bad) = self.dismissed_versions.iter().find(|v| Version::parse(v).is_err()) {
            return config_error(format!("dismissed version '{bad}' is not a valid version"));
        }
        let outside_install = |path: &PathBuf| {
            path.as_os_str().is_empty()
                || !path.components().all(|c| matches!(c, Component::Normal(_)))
                || path.components().next().is_some_and(|c| c.as_os_str() == "backup")
        };
        if let Some(bad) = self.backup_paths.iter().find(|p| outside_install(*p)) {
            return config_error(format!(
                "backup path '{}' must be relative to the installation and outside backup/",
                bad.display()
            ));
        }
        Ok(())
    }

    /// Whether a scheduled check is due at `now`.
    #[must_use]
    pub fn should_check(&self, now: DateTime<Utc>) -> bool {
        self.next_check().is_none_or(|next| now >= next)
    }

    /// When the next scheduled check is due, if a check has ever run.
    #[must_use]
    pub fn next_check(&self) -> Option<DateTime<Utc>> {
        self.last_check
            .map(|last| last + Duration::hours(i64::from(self.check_frequency_hours.max(1))))
    }

    #[must_use]
    pub fn is_dismissed(&self, version: &Version) -> bool {
        self.dismissed_versions
            .iter()
            .filter_map(|v| Version::parse(v).ok())
            .any(|v| &v == version)
    }

    pub fn dismiss(&mut self, version: &Version) {
        if !self.is_dismissed(version) {
            self.dismissed_versions.push(version.to_string());
        }
    }
}
