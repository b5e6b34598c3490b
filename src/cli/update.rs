//! `arcpress update` subcommands.
//!
//! Every subcommand drives the library through [`UpdateOrchestrator`]; none of
//! them touch the feed, backups or installed files directly while a session runs.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

use super::CliConfig;
use crate::config::GlobalConfig;
use crate::core::ErrorContext;
use crate::update::{
    BackupManager, HttpReleaseFeed, RiskAcknowledgement, SessionHandle, SessionState, UpdateEvent,
    UpdateHistoryStore, UpdateOrchestrator, UpdateOutcome, UpdateSession, Version, VersionDescriptor,
};
use crate::utils::paths::{UpdateLayout, default_install_dir, default_state_dir};
use crate::utils::progress::SessionProgress;

#[derive(Args, Debug)]
pub struct UpdateCommand {
    #[command(subcommand)]
    action: UpdateAction,
}

#[derive(Subcommand, Debug)]
enum UpdateAction {
    /// Check the release feed for a newer version.
    Check {
        /// Skip the check unless `check_frequency_hours` have passed since the last one.
        #[arg(long)]
        if_due: bool,
    },

    /// Download, verify and install the newest eligible release.
    Apply {
        /// Install even though backups are disabled, giving up automatic rollback.
        #[arg(long)]
        accept_no_backup: bool,
    },

    /// Restore the installation from a backup.
    Rollback {
        /// Backup id as shown by `arcpress update backups`.
        #[arg(value_name = "BACKUP_ID")]
        backup_id: String,
    },

    /// Show recorded update attempts.
    History {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List backups available for rollback.
    Backups,

    /// Stop offering a release; newer releases are still reported.
    Dismiss {
        #[arg(value_name = "VERSION")]
        version: String,
    },
}

impl UpdateCommand {
    pub async fn execute(self, cli: &CliConfig) -> Result<()> {
        let ctx = UpdateContext::load(cli).await?;
        match self.action {
            UpdateAction::Check {
                if_due,
            } => ctx.check(if_due).await,
            UpdateAction::Apply {
                accept_no_backup,
            } => ctx.apply(accept_no_backup).await,
            UpdateAction::Rollback {
                backup_id,
            } => ctx.rollback(&backup_id).await,
            UpdateAction::History {
                json,
            } => ctx.history(json).await,
            UpdateAction::Backups => ctx.backups().await,
            UpdateAction::Dismiss {
                version,
            } => ctx.dismiss(&version).await,
        }
    }
}

/// Everything a subcommand needs, resolved from flags and the environment.
struct UpdateContext {
    config: GlobalConfig,
    config_path: PathBuf,
    layout: UpdateLayout,
    current: Version,
    progress: bool,
    quiet: bool,
}

impl UpdateContext {
    async fn load(cli: &CliConfig) -> Result<Self> {
        let install_dir = match &cli.install_dir {
            Some(dir) => dir.clone(),
            None => default_install_dir()?,
        };
        let layout = UpdateLayout::new(install_dir, default_state_dir()?);
        let config_path = cli.config_path.clone().unwrap_or_else(|| layout.config_file());
        let config = GlobalConfig::load_with_optional(Some(config_path.clone())).await?;

        let current = installed_version(&layout.install_dir).await?;
        debug!("Installed version {} in {}", current, layout.install_dir.display());

        Ok(Self {
            config,
            config_path,
            layout,
            current,
            progress: !cli.no_progress,
            quiet: cli.quiet,
        })
    }

    fn say(&self, message: impl std::fmt::Display) {
        if !self.quiet {
            println!("{message}");
        }
    }

    fn orchestrator(&self) -> Result<UpdateOrchestrator> {
        let feed = HttpReleaseFeed::new(self.config.updates.fetch_retries)?;
        Ok(UpdateOrchestrator::new(Arc::new(feed), self.layout.clone()))
    }

    async fn check(mut self, if_due: bool) -> Result<()> {
        let now = Utc::now();
        if if_due && !self.config.updates.should_check(now) {
            if let Some(next) = self.config.updates.next_check() {
                self.say(format!("Next update check is due at {}", next.format("%Y-%m-%d %H:%M UTC")).dimmed());
            }
            return Ok(());
        }

        let orchestrator = self.orchestrator()?;
        let session = self.run_check(&orchestrator).await?.snapshot();
        self.record_check().await?;
        self.report(&session)
    }

    async fn apply(mut self, accept_no_backup: bool) -> Result<()> {
        let orchestrator = self.orchestrator()?;
        let handle = self.run_check(&orchestrator).await?;
        self.record_check().await?;

        let session = handle.snapshot();
        if session.state != SessionState::CandidateFound {
            return self.report(&session);
        }

        if let Some(candidate) = &session.candidate {
            self.say(format!("Installing {} (current: {})", candidate.version, self.current).cyan());
        }
        let ack = if accept_no_backup {
            RiskAcknowledgement::NoRollback
        } else {
            RiskAcknowledgement::Standard
        };

        let progress = SessionProgress::new(self.progress && !self.quiet);
        let watcher = watch_progress(&orchestrator, progress.clone());
        let handle = orchestrator.start_download_and_install(&handle, ack)?;
        let session = tokio::select! {
            session = handle.wait_settled() => session,
            Ok(()) = tokio::signal::ctrl_c() => {
                progress.stage("Cancelling");
                orchestrator.cancel(&handle)?;
                handle.wait_settled().await
            }
        };
        watcher.abort();
        progress.finish();

        self.report(&session)
    }

    async fn run_check(&self, orchestrator: &UpdateOrchestrator) -> Result<SessionHandle> {
        let progress = SessionProgress::new(self.progress && !self.quiet);
        let watcher = watch_progress(orchestrator, progress.clone());
        let handle = orchestrator.check_for_update(self.current.clone(), &self.config.updates)?;
        handle.wait_settled().await;
        watcher.abort();
        progress.finish();
        Ok(handle)
    }

    async fn record_check(&mut self) -> Result<()> {
        self.config.updates.last_check = Some(Utc::now());
        self.config
            .save_to(&self.config_path)
            .await
            .context("Failed to record the time of the last update check")
    }

    /// Print the outcome of a settled session. A failed session becomes the error.
    fn report(&self, session: &UpdateSession) -> Result<()> {
        match session.state {
            SessionState::UpToDate => {
                self.say(format!("arcpress {} is up to date", session.current_version).green());
            }
            SessionState::CandidateFound => {
                if let Some(candidate) = &session.candidate {
                    self.say(
                        format!("Update available: {} -> {}", session.current_version, candidate.version)
                            .green()
                            .bold(),
                    );
                    if let Some(notes) = &candidate.notes {
                        self.say(notes.dimmed());
                    }
                    if !session.rollback_available {
                        self.say(
                            "Backups are disabled; installing requires `--accept-no-backup`".yellow(),
                        );
                    }
                    self.say("Run `arcpress update apply` to install it");
                }
            }
            SessionState::Completed => {
                let version = session.candidate.as_ref().map_or_else(String::new, |c| c.version.to_string());
                self.say(format!("Updated arcpress {} -> {}", session.current_version, version).green().bold());
                if let Some(backup) = &session.backup_path {
                    self.say(format!("Previous version backed up to {}", backup.display()).dimmed());
                }
            }
            SessionState::Idle => {
                self.say("Update cancelled; nothing was changed".yellow());
            }
            SessionState::Failed => return Err(session_failure(session).into()),
            state => {
                debug!(%state, "Session settled in an unexpected state");
            }
        }
        Ok(())
    }

    async fn rollback(self, backup_id: &str) -> Result<()> {
        let orchestrator = self.orchestrator()?;
        self.say(format!("Restoring backup {backup_id}...").cyan());
        let record = orchestrator.rollback(backup_id).await?;
        self.say(
            format!("Restored arcpress {} ({} files)", record.source_version, record.file_manifest.len())
                .green()
                .bold(),
        );
        Ok(())
    }

    async fn dismiss(mut self, version: &str) -> Result<()> {
        let version = Version::parse(version)?;
        self.config.updates.dismiss(&version);
        self.config
            .save_to(&self.config_path)
            .await
            .context("Failed to save dismissed version")?;
        self.say(format!("arcpress {version} will no longer be offered").green());
        Ok(())
    }

    async fn history(self, json: bool) -> Result<()> {
        let entries = UpdateHistoryStore::new(self.layout.history_file()).list().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }
        if entries.is_empty() {
            println!("No updates recorded");
            return Ok(());
        }

        for entry in &entries {
            let outcome = match entry.outcome {
                UpdateOutcome::Applied => entry.outcome.to_string().green(),
                UpdateOutcome::Failed => entry.outcome.to_string().red(),
                UpdateOutcome::RolledBack => entry.outcome.to_string().yellow(),
            };
            println!(
                "{}  {:<12} {:<12} {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.version.to_string(),
                outcome,
                entry.detail.dimmed()
            );
        }
        Ok(())
    }

    async fn backups(self) -> Result<()> {
        let records = BackupManager::new(self.layout.backup_root()).list_backups().await?;
        if records.is_empty() {
            println!("No backups in {}", self.layout.backup_root().display());
            return Ok(());
        }

        for record in &records {
            println!(
                "{}  version {}  {} files, {} bytes  {}",
                record.backup_id.bold(),
                record.source_version,
                record.file_manifest.len(),
                record.total_size(),
                record.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
            );
        }
        Ok(())
    }
}

/// The version in `version.json`, or this binary's own version when there is none.
async fn installed_version(install_dir: &Path) -> Result<Version> {
    match VersionDescriptor::read(install_dir).await? {
        Some(descriptor) => Ok(descriptor.version),
        None => Ok(Version::parse(env!("CARGO_PKG_VERSION"))?),
    }
}

fn session_failure(session: &UpdateSession) -> ErrorContext {
    let Some(error) = &session.error else {
        return ErrorContext::new("Update failed");
    };
    let mut ctx = ErrorContext::for_session(error.kind, &error.message, session.backup_path.as_deref());
    if session.rolled_back && ctx.details.is_none() {
        ctx = ctx.with_details("The previous installation was restored");
    }
    ctx
}

fn stage_message(state: SessionState) -> &'static str {
    match state {
        SessionState::Checking => "Checking for updates",
        SessionState::Verifying => "Verifying download",
        SessionState::BackingUp => "Backing up current installation",
        SessionState::Applying => "Installing update",
        SessionState::RollingBack => "Restoring previous installation",
        _ => "",
    }
}

/// Mirror session events on the progress line until aborted.
fn watch_progress(orchestrator: &UpdateOrchestrator, progress: SessionProgress) -> JoinHandle<()> {
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(UpdateEvent::StateChanged {
                    state,
                    ..
                }) => {
                    let message = stage_message(state);
                    if !message.is_empty() {
                        progress.stage(message);
                    }
                }
                Ok(UpdateEvent::Progress {
                    received,
                    total,
                    ..
                }) => progress.download(received, total),
                Ok(UpdateEvent::Finished {
                    ..
                }) => {
                    progress.finish();
                    break;
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}
