//! Command-line interface for arcpress.
//!
//! ```bash
//! arcpress update check            # look for a newer release
//! arcpress update check --if-due   # only when the configured interval has passed
//! arcpress update apply            # check, download, verify, back up and install
//! arcpress update history --json   # every recorded update attempt
//! arcpress update backups          # snapshots available for rollback
//! arcpress update rollback <id>    # restore one of them
//! arcpress update dismiss 2.0.0    # stop offering a release
//! ```
//!
//! # Global options
//!
//! - `--verbose` / `--quiet` - log level (`RUST_LOG` is honored otherwise)
//! - `--config <path>` - alternative config file
//! - `--install-dir <path>` - installation to update (default: the executable's directory)
//! - `--no-progress` - no spinners or progress bars
//!
//! Commands return `anyhow::Result`; a session that ends `Failed` is returned as
//! an [`crate::core::ErrorContext`] so the binary can pick the exit code.

mod update;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

pub use update::UpdateCommand;

/// Settings derived from the global flags, shared by every command.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    /// Log filter when `RUST_LOG` is not set.
    pub log_level: String,
    pub no_progress: bool,
    pub quiet: bool,
    pub config_path: Option<PathBuf>,
    pub install_dir: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "arcpress",
    about = "arcpress - file compression utility",
    version,
    long_about = "arcpress compresses and extracts archives. The `update` command keeps the installation current."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to the configuration file (default: `$ARCPRESS_HOME/config.toml`).
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Installation directory to update (default: the executable's directory).
    #[arg(long, global = true, value_name = "PATH")]
    install_dir: Option<PathBuf>,

    /// Disable progress bars and spinners.
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check for, install and roll back arcpress updates.
    Update(UpdateCommand),
}

impl Cli {
    /// Run the selected command.
    ///
    /// # Errors
    ///
    /// Returns the command's error; see the module docs for how session failures
    /// are reported.
    pub async fn execute(self) -> Result<()> {
        let config = self.build_config();
        init_logging(&config.log_level);
        self.execute_with_config(config).await
    }

    #[must_use]
    pub fn build_config(&self) -> CliConfig {
        let log_level = if self.verbose {
            "arcpress=debug"
        } else if self.quiet {
            "error"
        } else {
            "warn"
        };

        CliConfig {
            log_level: log_level.to_string(),
            no_progress: self.no_progress,
            quiet: self.quiet,
            config_path: self.config.clone(),
            install_dir: self.install_dir.clone(),
        }
    }

    /// Run with an explicit configuration; logging is left as it is.
    pub async fn execute_with_config(self, config: CliConfig) -> Result<()> {
        match self.command {
            Commands::Update(cmd) => cmd.execute(&config).await,
        }
    }
}

/// Install the fmt subscriber. `RUST_LOG` wins over the flag-derived level.
fn init_logging(level: &str) {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level)
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config_levels() {
        let cli = Cli::parse_from(["arcpress", "--verbose", "update", "history"]);
        assert_eq!(cli.build_config().log_level, "arcpress=debug");

        let cli = Cli::parse_from(["arcpress", "update", "check", "--quiet", "--no-progress"]);
        let config = cli.build_config();
        assert_eq!(config.log_level, "error");
        assert!(config.quiet);
        assert!(config.no_progress);

        let cli = Cli::parse_from(["arcpress", "--install-dir", "/opt/arcpress", "update", "backups"]);
        assert_eq!(cli.build_config().install_dir, Some(PathBuf::from("/opt/arcpress")));
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["arcpress", "-v", "-q", "update", "check"]).is_err());
    }
}
