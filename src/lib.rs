//! arcpress - self-update engine and CLI.
//!
//! The library checks a release feed for newer versions of an installed
//! application, downloads and verifies the release artifact, backs up the files
//! it replaces, installs the update and rolls back automatically when
//! installing fails.
//!
//! # Modules
//!
//! - [`update`] - the engine: versions, feed, verification, backups, history and
//!   the session orchestrator
//! - [`config`] - the global `config.toml` and its `[updates]` section
//! - [`core`] - error types and user-facing error rendering
//! - [`cli`] - the `arcpress update` command line
//! - [`utils`] - filesystem, path layout and progress helpers
//!
//! # Example
//!
//! ```rust,no_run
//! use arcpress::config::GlobalConfig;
//! use arcpress::update::{HttpReleaseFeed, SessionState, UpdateOrchestrator, Version};
//! use arcpress::utils::paths::{UpdateLayout, default_install_dir, default_state_dir};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = GlobalConfig::load().await?;
//! let layout = UpdateLayout::new(default_install_dir()?, default_state_dir()?);
//! let feed = Arc::new(HttpReleaseFeed::new(config.updates.fetch_retries)?);
//! let orchestrator = UpdateOrchestrator::new(feed, layout);
//!
//! let handle = orchestrator.check_for_update(Version::parse("1.4.0")?, &config.updates)?;
//! if handle.wait_settled().await.state == SessionState::CandidateFound {
//!     println!("an update is available");
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod update;
pub mod utils;
