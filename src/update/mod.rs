//! Self-update engine for arcpress.
//!
//! This module checks a release feed for newer versions, downloads and verifies
//! the release artifact, snapshots the files it is about to replace, applies the
//! update and rolls back automatically when applying fails. Every finished
//! attempt is recorded in an append-only history.
//!
//! # Architecture
//!
//! - [`version`] - release version parsing and ordering
//! - [`feed`] - the [`ReleaseFeed`] trait and its HTTP implementation
//! - [`verification`] - streaming SHA-256 checks
//! - [`backup`] - pre-update snapshots with atomic restore
//! - [`artifact`] - ZIP validation, extraction and file replacement
//! - [`descriptor`] - the installed `version.json`
//! - [`history`] - the JSON-lines update history
//! - [`config`] - the `[updates]` configuration section
//! - [`orchestrator`] - the session state machine tying everything together
//!
//! Only the orchestrator holds cross-cutting state. Front-ends (the CLI, or a
//! GUI embedding the library) start sessions through it and follow progress via
//! [`SessionHandle`] snapshots or the [`UpdateEvent`] channel; they never touch
//! backups or the feed directly while a session runs.
//!
//! # Update flow
//!
//! 1. **Check**: fetch the feed under `check_timeout_secs`, select the highest
//!    eligible version newer than the running one.
//! 2. **Download**: stream the artifact into `<state_dir>/staging/<session>/`.
//! 3. **Verify**: SHA-256 against the feed's checksum, then validate and extract
//!    the ZIP.
//! 4. **Back up**: copy every file the update will overwrite, plus `version.json`.
//! 5. **Apply**: copy the extracted files over the installation, write the new
//!    descriptor.
//! 6. **Roll back** on apply failure: remove files the update created and restore
//!    the backup.
//!
//! # Examples
//!
//! ```rust,no_run
//! use arcpress::update::{HttpReleaseFeed, RiskAcknowledgement, SessionState, UpdateConfig,
//!     UpdateOrchestrator, Version};
//! use arcpress::utils::paths::UpdateLayout;
//! use std::sync::Arc;
//!
//! # async fn example() -> arcpress::core::UpdateResult<()> {
//! let config = UpdateConfig::default();
//! let feed = Arc::new(HttpReleaseFeed::new(config.fetch_retries)?);
//! let orchestrator = UpdateOrchestrator::new(feed, UpdateLayout::new("/opt/arcpress", "/home/me/.arcpress"));
//!
//! let handle = orchestrator.check_for_update(Version::parse("1.4.0")?, &config)?;
//! let session = handle.wait_settled().await;
//! if session.state == SessionState::CandidateFound {
//!     orchestrator.start_download_and_install(&handle, RiskAcknowledgement::Standard)?;
//!     let done = handle.wait_settled().await;
//!     println!("update finished: {}", done.state);
//! }
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod backup;
pub mod config;
pub mod descriptor;
pub mod feed;
pub mod history;
pub mod orchestrator;
pub mod verification;
pub mod version;

pub use backup::{BackupManager, BackupRecord, ManifestEntry};
pub use config::UpdateConfig;
pub use descriptor::VersionDescriptor;
pub use feed::{ArtifactDownload, HttpReleaseFeed, ReleaseCandidate, ReleaseFeed};
pub use history::{UpdateHistoryEntry, UpdateHistoryStore, UpdateOutcome};
pub use orchestrator::{
    RiskAcknowledgement, SessionError, SessionHandle, SessionState, UpdateEvent, UpdateOrchestrator,
    UpdateSession,
};
pub use verification::ChecksumVerifier;
pub use version::{Version, compare, is_newer};
