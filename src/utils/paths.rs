//! Where arcpress keeps its files.
//!
//! Two roots are involved:
//!
//! - the **install dir**, holding the application files, `version.json` and the
//!   `backup/` directory;
//! - the **state dir** (`$ARCPRESS_HOME`, or `~/.arcpress`), holding
//!   `config.toml`, `update_history.jsonl` and per-session `staging/` directories.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Environment variable overriding the state directory.
pub const HOME_ENV: &str = "ARCPRESS_HOME";

/// Resolve the state directory.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let home = dirs::home_dir().ok_or_else(|| {
        let platform_help = if cfg!(windows) {
            "On Windows: Check that the USERPROFILE environment variable is set"
        } else {
            "On Unix/Linux: Check that the HOME environment variable is set"
        };
        anyhow::anyhow!(
            "Could not determine home directory.\n\n{platform_help}, or set {HOME_ENV}"
        )
    })?;
    Ok(home.join(".arcpress"))
}

/// The directory containing the running executable.
pub fn default_install_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate the running executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("Executable {} has no parent directory", exe.display()))
}

/// Resolved file layout for one installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateLayout {
    pub install_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl UpdateLayout {
    pub fn new(install_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    #[must_use]
    pub fn backup_root(&self) -> PathBuf {
        self.install_dir.join("backup")
    }

    #[must_use]
    pub fn staging_root(&self) -> PathBuf {
        self.state_dir.join("staging")
    }

    #[must_use]
    pub fn session_staging(&self, session_id: Uuid) -> PathBuf {
        self.staging_root().join(session_id.to_string())
    }

    #[must_use]
    pub fn history_file(&self) -> PathBuf {
        self.state_dir.join(crate::update::history::HISTORY_FILE)
    }

    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(crate::config::CONFIG_FILE)
    }
}
