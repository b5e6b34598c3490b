//! The global configuration file, `<state_dir>/config.toml`.
//!
//! Only the `[updates]` section is defined today:
//!
//! ```toml
//! [updates]
//! auto_check = true
//! check_frequency_hours = 24
//! backup_enabled = true
//! update_server_url = "https://api.github.com/repos/arcpress/arcpress/releases"
//! last_check = "2026-10-01T08:30:00Z"
//! ```
//!
//! The file may also hold `last_check` and `dismissed_versions`, which the CLI
//! writes back after a check or `update dismiss`, so it is saved with
//! owner-only permissions on Unix.
//!
//! # Examples
//!
//! ```rust,no_run
//! use arcpress::config::GlobalConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut config = GlobalConfig::load().await?;
//! config.updates.check_frequency_hours = 12;
//! config.save_to(&GlobalConfig::default_path()?).await?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::update::UpdateConfig;
use crate::utils::paths::default_state_dir;

/// File name of the global configuration inside the state directory.
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub updates: UpdateConfig,
}

impl GlobalConfig {
    /// Load from the default location, or defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directory cannot be determined or the file
    /// exists but cannot be read, parsed or validated.
    pub async fn load() -> Result<Self> {
        Self::load_with_optional(None).await
    }

    /// Load from `path` if given, otherwise from the default location.
    ///
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// See [`GlobalConfig::load`].
    pub async fn load_with_optional(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => Self::default_path()?,
        };
        if fs::try_exists(&path).await.unwrap_or(false) {
            Self::load_from(&path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Load and validate the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or holds
    /// settings [`UpdateConfig::validate`] rejects.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read global config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse global config from {}", path.display()))?;
        config
            .updates
            .validate()
            .with_context(|| format!("Invalid [updates] section in {}", path.display()))?;
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the file cannot be written.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize global config")?;
        crate::utils::fs::atomic_write(path, content.as_bytes())
            .await
            .with_context(|| format!("Failed to write global config to {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mut perms = fs::metadata(path)
                .await
                .with_context(|| format!("Failed to read permissions for {}", path.display()))?
                .permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms).await.with_context(|| {
                format!("Failed to set secure permissions on {}", path.display())
            })?;
        }

        Ok(())
    }

    /// `<state_dir>/config.toml`, honoring `ARCPRESS_HOME`.
    ///
    /// # Errors
    ///
    /// Returns an error if no home directory can be determined.
    pub fn default_path() -> Result<PathBuf> {
        Ok(default_state_dir()?.join(CONFIG_FILE))
    }
}
