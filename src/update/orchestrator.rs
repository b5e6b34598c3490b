//! The update session state machine.
//!
//! [`UpdateOrchestrator`] owns at most one session at a time. A session moves
//! through these states:
//!
//! ```text
//! Idle -> Checking -> UpToDate
//!                  -> CandidateFound -> Downloading -> Verifying -> BackingUp -> Applying -> Completed
//!                                                                                       \-> RollingBack -> Failed
//! (any step before Applying) -> Failed | Idle (cancelled)
//! ```
//!
//! Work runs on a spawned tokio task. Callers hold a [`SessionHandle`] (a
//! `watch` receiver over [`UpdateSession`] snapshots) and may subscribe to the
//! [`UpdateEvent`] broadcast channel. Every session that ends `Completed` or
//! `Failed` appends exactly one entry to the update history; `UpToDate` and
//! cancelled sessions append none.
//!
//! Cancellation is honored while checking, downloading, verifying and backing
//! up. Once files start being replaced it is ignored until the session settles.
//!
//! A manual [`UpdateOrchestrator::rollback`] occupies the same slot, shown as a
//! `RollingBack` session that returns to `Idle` when the restore is done.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::{ErrorKind, UpdateError, UpdateResult};
use crate::update::artifact::{self, ApplyPlan, ExtractedArtifact};
use crate::update::backup::{self, BackupManager, BackupRecord};
use crate::update::descriptor::{DESCRIPTOR_FILE, VersionDescriptor};
use crate::update::history::{UpdateHistoryEntry, UpdateHistoryStore, UpdateOutcome};
use crate::update::{ChecksumVerifier, ReleaseCandidate, ReleaseFeed, UpdateConfig, Version, is_newer};
use crate::utils::paths::UpdateLayout;

const EVENT_CAPACITY: usize = 256;
const ARTIFACT_FILE: &str = "artifact.zip";
const EXTRACT_DIR: &str = "extracted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Checking,
    CandidateFound,
    UpToDate,
    Downloading,
    Verifying,
    BackingUp,
    Applying,
    RollingBack,
    Completed,
    Failed,
}

impl SessionState {
    /// A session in this state either has work running or is parked waiting
    /// for the caller.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::UpToDate | Self::Completed | Self::Failed)
    }

    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        !matches!(self, Self::Applying | Self::RollingBack) && self.is_active()
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::CandidateFound => "candidate found",
            Self::UpToDate => "up to date",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::BackingUp => "backing up",
            Self::Applying => "applying",
            Self::RollingBack => "rolling back",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a session failed, in a form that can be cloned into snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&UpdateError> for SessionError {
    fn from(error: &UpdateError) -> Self {
        Self {
            kind: error.kind(),
            message: error.full_message(),
        }
    }
}

/// Snapshot of a session as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateSession {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub current_version: Version,
    pub candidate: Option<ReleaseCandidate>,
    pub state: SessionState,
    pub backup_path: Option<PathBuf>,
    pub error: Option<SessionError>,
    /// Download progress, 0.0 to 1.0.
    pub progress: f64,
    /// Whether a failed apply can be undone automatically.
    pub rollback_available: bool,
    /// Parked in `CandidateFound` until [`UpdateOrchestrator::start_download_and_install`].
    pub awaiting_confirmation: bool,
    /// The installation was restored after a failed apply.
    pub rolled_back: bool,
}

impl UpdateSession {
    fn new(current_version: Version) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            current_version,
            candidate: None,
            state: SessionState::Checking,
            backup_path: None,
            error: None,
            progress: 0.0,
            rollback_available: false,
            awaiting_confirmation: false,
            rolled_back: false,
        }
    }

    /// No work is running for this session.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !self.state.is_active() || self.awaiting_confirmation
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    StateChanged {
        session_id: Uuid,
        state: SessionState,
    },
    Progress {
        session_id: Uuid,
        received: u64,
        total: Option<u64>,
    },
    Finished {
        session_id: Uuid,
        state: SessionState,
        error: Option<SessionError>,
    },
}

/// Explicit acceptance of the risks of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RiskAcknowledgement {
    /// No extra risk accepted.
    #[default]
    Standard,
    /// Proceed without a backup, so a failed apply cannot be rolled back.
    NoRollback,
}

/// Caller's view of one session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    rx: watch::Receiver<UpdateSession>,
}

impl SessionHandle {
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Latest snapshot.
    #[must_use]
    pub fn snapshot(&self) -> UpdateSession {
        self.rx.borrow().clone()
    }

    /// Wait until no work is running for the session, and return that snapshot.
    pub async fn wait_settled(&self) -> UpdateSession {
        let mut rx = self.rx.clone();
        if let Ok(session) = rx.wait_for(UpdateSession::is_settled).await {
            return session.clone();
        }
        rx.borrow().clone()
    }
}

struct SessionSlot {
    session_id: Uuid,
    tx: Arc<watch::Sender<UpdateSession>>,
    cancel: CancellationToken,
    config: UpdateConfig,
}

impl SessionSlot {
    fn handle(&self) -> SessionHandle {
        SessionHandle {
            session_id: self.session_id,
            rx: self.tx.subscribe(),
        }
    }

    fn state(&self) -> SessionState {
        self.tx.borrow().state
    }
}

struct Inner {
    feed: Arc<dyn ReleaseFeed>,
    layout: UpdateLayout,
    backups: BackupManager,
    history: UpdateHistoryStore,
    events: broadcast::Sender<UpdateEvent>,
    slot: Mutex<Option<SessionSlot>>,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Option<SessionSlot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives update sessions for one installation.
pub struct UpdateOrchestrator {
    inner: Arc<Inner>,
}

impl UpdateOrchestrator {
    pub fn new(feed: Arc<dyn ReleaseFeed>, layout: UpdateLayout) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                feed,
                backups: BackupManager::new(layout.backup_root()),
                history: UpdateHistoryStore::new(layout.history_file()),
                layout,
                events,
                slot: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn layout(&self) -> &UpdateLayout {
        &self.inner.layout
    }

    #[must_use]
    pub fn backups(&self) -> &BackupManager {
        &self.inner.backups
    }

    /// Receive every [`UpdateEvent`] published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.inner.events.subscribe()
    }

    /// Start a check against the feed, or return the session already in progress.
    ///
    /// A session that is checking, working, or parked in `CandidateFound` is
    /// returned as-is; a new one is only started once the previous one settled
    /// in a final state.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if `config` is invalid.
    pub fn check_for_update(&self, current: Version, config: &UpdateConfig) -> UpdateResult<SessionHandle> {
        config.validate()?;

        let mut slot = self.inner.slot();
        if let Some(existing) = slot.as_ref()
            && existing.state().is_active()
        {
            debug!(session_id = %existing.session_id, "Update session already in progress");
            return Ok(existing.handle());
        }

        let session = UpdateSession::new(current.clone());
        let session_id = session.session_id;
        let (tx, _) = watch::channel(session);
        let new_slot = SessionSlot {
            session_id,
            tx: Arc::new(tx),
            cancel: CancellationToken::new(),
            config: config.clone(),
        };
        let handle = new_slot.handle();

        let runner = SessionRunner {
            inner: Arc::clone(&self.inner),
            session_id,
            tx: Arc::clone(&new_slot.tx),
            cancel: new_slot.cancel.clone(),
            config: config.clone(),
            current,
        };
        *slot = Some(new_slot);
        drop(slot);

        info!(session_id = %session_id, "Checking for updates");
        runner.emit(UpdateEvent::StateChanged {
            session_id,
            state: SessionState::Checking,
        });
        tokio::spawn(runner.run_check());

        Ok(handle)
    }

    /// Continue a session parked in `CandidateFound`.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::SessionNotFound`] if `handle` is not the current session
    /// - [`UpdateError::InvalidTransition`] if the session is not in `CandidateFound`
    /// - [`UpdateError::RiskNotAcknowledged`] if backups are disabled and `ack`
    ///   is not [`RiskAcknowledgement::NoRollback`]
    pub fn start_download_and_install(
        &self,
        handle: &SessionHandle,
        ack: RiskAcknowledgement,
    ) -> UpdateResult<SessionHandle> {
        let slot = self.inner.slot();
        let current = slot
            .as_ref()
            .filter(|s| s.session_id == handle.session_id)
            .ok_or_else(|| UpdateError::SessionNotFound {
                session_id: handle.session_id.to_string(),
            })?;

        let state = current.state();
        if state != SessionState::CandidateFound {
            return Err(UpdateError::InvalidTransition {
                state: state.to_string(),
                action: "start download".to_string(),
            });
        }
        if !current.config.backup_enabled && ack != RiskAcknowledgement::NoRollback {
            return Err(UpdateError::RiskNotAcknowledged {
                risk: "backups are disabled, so a failed update cannot be rolled back".to_string(),
            });
        }

        let runner = SessionRunner {
            inner: Arc::clone(&self.inner),
            session_id: current.session_id,
            tx: Arc::clone(&current.tx),
            cancel: current.cancel.clone(),
            config: current.config.clone(),
            current: current.tx.borrow().current_version.clone(),
        };
        // Leave CandidateFound while holding the slot so a concurrent call sees it.
        runner.transition(SessionState::Downloading, |s| s.awaiting_confirmation = false);
        let handle = current.handle();
        drop(slot);

        tokio::spawn(async move { runner.run_install().await });
        Ok(handle)
    }

    /// Request cancellation of a session.
    ///
    /// A parked session returns to `Idle` immediately; a running one stops at
    /// the next cancellation point. Ignored while applying or rolling back and
    /// for sessions that already settled.
    pub fn cancel(&self, handle: &SessionHandle) -> UpdateResult<()> {
        let slot = self.inner.slot();
        let current = slot
            .as_ref()
            .filter(|s| s.session_id == handle.session_id)
            .ok_or_else(|| UpdateError::SessionNotFound {
                session_id: handle.session_id.to_string(),
            })?;

        let state = current.state();
        if !state.is_cancellable() {
            debug!(session_id = %current.session_id, %state, "Ignoring cancel request");
            return Ok(());
        }

        info!(session_id = %current.session_id, %state, "Cancelling update session");
        let parked = current.tx.borrow().awaiting_confirmation;
        if parked {
            current.tx.send_modify(|s| {
                s.state = SessionState::Idle;
                s.awaiting_confirmation = false;
            });
            let _ = self.inner.events.send(UpdateEvent::Finished {
                session_id: current.session_id,
                state: SessionState::Idle,
                error: None,
            });
        } else {
            current.cancel.cancel();
        }
        Ok(())
    }

    /// Snapshot of the given session.
    #[must_use]
    pub fn status(&self, handle: &SessionHandle) -> UpdateSession {
        handle.snapshot()
    }

    /// Every recorded update outcome, oldest first.
    pub async fn history(&self) -> UpdateResult<Vec<UpdateHistoryEntry>> {
        self.inner.history.list().await
    }

    /// Restore a backup by id, outside of any session.
    ///
    /// The session slot is held in `RollingBack` until the restore finishes, so
    /// no check or install can start against the same installation meanwhile.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::InvalidTransition`] while a session is active
    /// - [`UpdateError::RollbackFailed`] if the backup cannot be loaded or restored
    pub async fn rollback(&self, backup_id: &str) -> UpdateResult<BackupRecord> {
        let backup_path = self.inner.backups.backup_root().join(backup_id);
        let rollback_failed = |reason: String| UpdateError::RollbackFailed {
            backup_path: backup_path.clone(),
            reason,
        };

        let version = backup::version_from_id(backup_id)
            .ok_or_else(|| rollback_failed(format!("'{backup_id}' is not a backup id")))?;
        let _claim = self.claim_for_rollback(version, &backup_path)?;

        let record = self
            .inner
            .backups
            .load(backup_id)
            .await
            .map_err(|e| rollback_failed(e.full_message()))?;
        self.inner
            .backups
            .restore(&record, &self.inner.layout.install_dir)
            .await
            .map_err(|e| rollback_failed(e.full_message()))?;

        let entry = UpdateHistoryEntry::new(
            record.source_version.clone(),
            UpdateOutcome::RolledBack,
            format!("manual rollback from {}", record.backup_id),
        );
        self.inner.history.append(&entry).await?;

        info!("Rolled back to {} from {}", record.source_version, record.backup_id);
        Ok(record)
    }

    fn claim_for_rollback(&self, version: Version, backup_path: &Path) -> UpdateResult<RollbackClaim> {
        let mut slot = self.inner.slot();
        if let Some(state) = slot.as_ref().map(SessionSlot::state).filter(|s| s.is_active()) {
            return Err(UpdateError::InvalidTransition {
                state: state.to_string(),
                action: "roll back".to_string(),
            });
        }

        let mut session = UpdateSession::new(version);
        session.state = SessionState::RollingBack;
        session.backup_path = Some(backup_path.to_path_buf());
        let session_id = session.session_id;
        let (tx, _) = watch::channel(session);
        let tx = Arc::new(tx);
        *slot = Some(SessionSlot {
            session_id,
            tx: Arc::clone(&tx),
            cancel: CancellationToken::new(),
            config: UpdateConfig::default(),
        });
        drop(slot);

        info!(session_id = %session_id, "Rolling back from {}", backup_path.display());
        let _ = self.inner.events.send(UpdateEvent::StateChanged {
            session_id,
            state: SessionState::RollingBack,
        });
        Ok(RollbackClaim {
            events: self.inner.events.clone(),
            session_id,
            tx,
        })
    }
}

/// Occupies the session slot during a manual rollback; frees it when dropped.
struct RollbackClaim {
    events: broadcast::Sender<UpdateEvent>,
    session_id: Uuid,
    tx: Arc<watch::Sender<UpdateSession>>,
}

impl Drop for RollbackClaim {
    fn drop(&mut self) {
        self.tx.send_modify(|s| s.state = SessionState::Idle);
        let _ = self.events.send(UpdateEvent::Finished {
            session_id: self.session_id,
            state: SessionState::Idle,
            error: None,
        });
    }
}

/// Everything a spawned session task needs.
struct SessionRunner {
    inner: Arc<Inner>,
    session_id: Uuid,
    tx: Arc<watch::Sender<UpdateSession>>,
    cancel: CancellationToken,
    config: UpdateConfig,
    current: Version,
}

/// How the install phase ended, before history is written.
enum InstallEnd {
    Completed,
    Cancelled,
    Failed(UpdateError, UpdateOutcome),
}

impl SessionRunner {
    fn emit(&self, event: UpdateEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn transition(&self, state: SessionState, modify: impl FnOnce(&mut UpdateSession)) {
        self.tx.send_modify(|s| {
            s.state = state;
            modify(s);
        });
        debug!(session_id = %self.session_id, %state, "Session state changed");
        self.emit(UpdateEvent::StateChanged {
            session_id: self.session_id,
            state,
        });
    }

    fn snapshot(&self) -> UpdateSession {
        self.tx.borrow().clone()
    }

    fn staging_dir(&self) -> PathBuf {
        self.inner.layout.session_staging(self.session_id)
    }

    async fn run_check(self) {
        let url = self.config.update_server_url.clone();
        let timeout = Duration::from_secs(self.config.check_timeout_secs);
        let fetch = tokio::time::timeout(timeout, self.inner.feed.fetch_candidates(&url, self.config.allow_prereleases));

        let fetched = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                self.settle_cancelled().await;
                return;
            }
            result = fetch => result.unwrap_or_else(|_| {
                Err(UpdateError::network("feed fetch", None, format!("timed out after {}s", timeout.as_secs())))
            }),
        };

        let candidates = match fetched {
            Ok(candidates) => candidates,
            Err(e) => {
                self.settle_failed(e, UpdateOutcome::Failed, self.current.clone()).await;
                return;
            }
        };

        let Some(candidate) = self.select_candidate(candidates) else {
            info!(session_id = %self.session_id, "No newer release than {}", self.current);
            self.transition(SessionState::UpToDate, |s| s.progress = 1.0);
            self.emit_finished(SessionState::UpToDate, None);
            return;
        };

        if candidate.min_supported_version > self.current {
            let error = UpdateError::IncompatibleUpdate {
                candidate: candidate.version.to_string(),
                required: candidate.min_supported_version.to_string(),
                current: self.current.to_string(),
            };
            let version = candidate.version.clone();
            self.tx.send_modify(|s| s.candidate = Some(candidate));
            self.settle_failed(error, UpdateOutcome::Failed, version).await;
            return;
        }

        info!(session_id = %self.session_id, "Update available: {} -> {}", self.current, candidate.version);
        let backup_enabled = self.config.backup_enabled;
        let auto_continue = self.config.auto_download && self.config.auto_install && backup_enabled;
        if self.config.auto_download && self.config.auto_install && !backup_enabled {
            warn!("Automatic install skipped: backups are disabled and the risk must be accepted explicitly");
        }

        self.transition(SessionState::CandidateFound, |s| {
            s.candidate = Some(candidate);
            s.rollback_available = backup_enabled;
            s.awaiting_confirmation = !auto_continue;
        });

        if auto_continue {
            self.transition(SessionState::Downloading, |_| {});
            self.run_install().await;
        }
    }

    fn select_candidate(&self, candidates: Vec<ReleaseCandidate>) -> Option<ReleaseCandidate> {
        candidates
            .into_iter()
            .filter(|c| is_newer(&c.version, &self.current))
            .filter(|c| self.config.allow_prereleases || !c.is_prerelease)
            .filter(|c| {
                let dismissed = self.config.is_dismissed(&c.version);
                if dismissed {
                    debug!("Skipping dismissed version {}", c.version);
                }
                !dismissed
            })
            .max_by(|a, b| a.version.cmp(&b.version))
    }

    /// Downloading through Completed. Entered with the state already `Downloading`.
    async fn run_install(self) {
        let Some(candidate) = self.snapshot().candidate else {
            let error = UpdateError::InvalidTransition {
                state: SessionState::Downloading.to_string(),
                action: "install without a candidate".to_string(),
            };
            self.settle_failed(error, UpdateOutcome::Failed, self.current.clone()).await;
            return;
        };

        let end = self.install(&candidate).await;
        self.remove_staging().await;

        match end {
            InstallEnd::Completed => {
                let entry = UpdateHistoryEntry::new(
                    candidate.version.clone(),
                    UpdateOutcome::Applied,
                    format!("updated from {}", self.current),
                )
                .with_session(self.session_id.to_string());
                self.record(&entry).await;
                info!(session_id = %self.session_id, "Updated to {}", candidate.version);
                self.transition(SessionState::Completed, |s| s.progress = 1.0);
                self.emit_finished(SessionState::Completed, None);
            }
            InstallEnd::Cancelled => self.settle_cancelled().await,
            InstallEnd::Failed(error, outcome) => {
                self.settle_failed(error, outcome, candidate.version.clone()).await;
            }
        }
    }

    async fn install(&self, candidate: &ReleaseCandidate) -> InstallEnd {
        let staging = self.staging_dir();
        let artifact_path = staging.join(ARTIFACT_FILE);

        let download_timeout = Duration::from_secs(self.config.download_timeout_secs);
        let downloaded =
            match tokio::time::timeout(download_timeout, self.download(candidate, &staging, &artifact_path)).await {
                Ok(result) => result,
                Err(_) => Err(UpdateError::network(
                    "artifact download",
                    None,
                    format!("timed out after {}s", download_timeout.as_secs()),
                )),
            };
        if let Err(e) = downloaded {
            return Self::end_early(e);
        }

        if self.cancel.is_cancelled() {
            return InstallEnd::Cancelled;
        }
        self.transition(SessionState::Verifying, |_| {});
        let extracted = match self.verify(candidate, &artifact_path, &staging).await {
            Ok(extracted) => extracted,
            Err(e) => return Self::end_early(e),
        };

        if self.cancel.is_cancelled() {
            return InstallEnd::Cancelled;
        }
        let install_dir = self.inner.layout.install_dir.clone();
        let descriptor = match VersionDescriptor::read_or_init(&install_dir, &self.current).await {
            Ok(descriptor) => descriptor,
            Err(e) => return Self::end_early(e),
        };
        let plan = match artifact::plan_apply(&extracted, &install_dir).await {
            Ok(plan) => plan,
            Err(e) => return Self::end_early(e),
        };

        let backup = if self.config.backup_enabled {
            self.transition(SessionState::BackingUp, |_| {});
            match self.back_up(&plan).await {
                Ok(record) => Some(record),
                Err(e) => return Self::end_early(e),
            }
        } else {
            warn!(session_id = %self.session_id, "Backups disabled; applying without a rollback point");
            None
        };

        self.transition(SessionState::Applying, |_| {});
        let applied = match artifact::apply_plan(&extracted, &plan, &install_dir).await {
            Ok(()) => descriptor.advance(candidate.version.clone(), candidate.notes.clone()).write(&install_dir).await,
            Err(e) => Err(e),
        };
        let Err(apply_error) = applied else {
            return InstallEnd::Completed;
        };

        error!(
            session_id = %self.session_id,
            state = %SessionState::Applying,
            error = %apply_error.full_message(),
            "Applying update failed"
        );

        let Some(record) = backup else {
            error!(
                session_id = %self.session_id,
                "No backup was taken; the installation may be inconsistent"
            );
            return InstallEnd::Failed(apply_error, UpdateOutcome::Failed);
        };

        self.transition(SessionState::RollingBack, |_| {});
        match self.roll_back(&record, &plan, &install_dir).await {
            Ok(()) => {
                info!(session_id = %self.session_id, "Restored previous installation from {}", record.backup_id);
                self.tx.send_modify(|s| s.rolled_back = true);
                InstallEnd::Failed(apply_error, UpdateOutcome::RolledBack)
            }
            Err(rollback_error) => {
                error!(
                    session_id = %self.session_id,
                    state = %SessionState::RollingBack,
                    error = %rollback_error.full_message(),
                    backup = %record.path.display(),
                    "Rollback failed; manual recovery required"
                );
                let error = UpdateError::RollbackFailed {
                    backup_path: record.path.clone(),
                    reason: format!(
                        "{}; apply error was: {}",
                        rollback_error.full_message(),
                        apply_error.full_message()
                    ),
                };
                InstallEnd::Failed(error, UpdateOutcome::Failed)
            }
        }
    }

    fn end_early(error: UpdateError) -> InstallEnd {
        if matches!(error, UpdateError::Cancelled { .. }) {
            InstallEnd::Cancelled
        } else {
            InstallEnd::Failed(error, UpdateOutcome::Failed)
        }
    }

    async fn download(&self, candidate: &ReleaseCandidate, staging: &Path, dest: &Path) -> UpdateResult<()> {
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|e| UpdateError::io("create staging directory", staging, e))?;

        let mut download = self.inner.feed.open_artifact(&candidate.download_url).await?;
        let total = download
            .total_bytes
            .or((candidate.size_bytes > 0).then_some(candidate.size_bytes));

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| UpdateError::io("create download file", dest, e))?;
        let mut received: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return Err(UpdateError::Cancelled {
                        operation: "download".to_string(),
                    });
                }
                chunk = download.chunks.next() => chunk,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| UpdateError::io("write download data", dest, e))?;

            received += chunk.len() as u64;
            let progress = total.filter(|t| *t > 0).map_or(0.0, |t| (received as f64 / t as f64).min(1.0));
            self.tx.send_modify(|s| s.progress = progress);
            self.emit(UpdateEvent::Progress {
                session_id: self.session_id,
                received,
                total,
            });
        }

        file.sync_all()
            .await
            .map_err(|e| UpdateError::io("flush download file", dest, e))?;
        info!(session_id = %self.session_id, "Downloaded {} bytes", received);
        Ok(())
    }

    async fn verify(
        &self,
        candidate: &ReleaseCandidate,
        artifact_path: &Path,
        staging: &Path,
    ) -> UpdateResult<ExtractedArtifact> {
        if self.config.verify_checksum {
            ChecksumVerifier::verify(artifact_path, &candidate.checksum).await?;
        } else {
            warn!(session_id = %self.session_id, "Checksum verification disabled");
        }
        artifact::extract_artifact(artifact_path, &staging.join(EXTRACT_DIR), &self.config.required_paths).await
    }

    async fn back_up(&self, plan: &ApplyPlan) -> UpdateResult<BackupRecord> {
        let mut files: Vec<PathBuf> = plan.overwritten.clone();
        files.push(PathBuf::from(DESCRIPTOR_FILE));
        files.extend(self.config.backup_paths.iter().cloned());
        files.sort();
        files.dedup();

        let record = self
            .inner
            .backups
            .create_backup(&self.inner.layout.install_dir, &files, &self.current, &self.cancel)
            .await?;
        let path = record.path.clone();
        self.tx.send_modify(|s| s.backup_path = Some(path));
        Ok(record)
    }

    /// Restore first: a backup that cannot be staged leaves the failed update
    /// in place, created files included.
    async fn roll_back(&self, record: &BackupRecord, plan: &ApplyPlan, install_dir: &Path) -> UpdateResult<()> {
        self.inner.backups.restore(record, install_dir).await?;
        artifact::remove_created(install_dir, &plan.created).await
    }

    async fn remove_staging(&self) {
        let staging = self.staging_dir();
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => debug!("Removed staging directory {}", staging.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staging directory {}: {}", staging.display(), e),
        }
    }

    async fn record(&self, entry: &UpdateHistoryEntry) {
        if let Err(e) = self.inner.history.append(entry).await {
            error!(session_id = %self.session_id, error = %e.full_message(), "Failed to record update history");
        }
    }

    fn emit_finished(&self, state: SessionState, error: Option<SessionError>) {
        self.emit(UpdateEvent::Finished {
            session_id: self.session_id,
            state,
            error,
        });
    }

    async fn settle_failed(&self, error: UpdateError, outcome: UpdateOutcome, version: Version) {
        let failed_in = self.snapshot().state;
        error!(
            session_id = %self.session_id,
            state = %failed_in,
            error = %error.full_message(),
            "Update session failed"
        );
        self.remove_staging().await;

        let entry = UpdateHistoryEntry::new(version, outcome, error.full_message())
            .with_session(self.session_id.to_string());
        self.record(&entry).await;

        let session_error = SessionError::from(&error);
        let for_snapshot = session_error.clone();
        self.transition(SessionState::Failed, move |s| {
            s.error = Some(for_snapshot);
            s.awaiting_confirmation = false;
        });
        self.emit_finished(SessionState::Failed, Some(session_error));
    }

    async fn settle_cancelled(&self) {
        info!(session_id = %self.session_id, "Update session cancelled");
        self.remove_staging().await;
        self.transition(SessionState::Idle, |s| {
            s.progress = 0.0;
            s.awaiting_confirmation = false;
        });
        self.emit_finished(SessionState::Idle, None);
    }
}
