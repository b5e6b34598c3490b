//! Filesystem, path and terminal helpers shared by the engine and the CLI.
//!
//! # Modules
//!
//! - [`fs`] - atomic writes and directory listing
//! - [`paths`] - the install and state directory layout
//! - [`progress`] - spinners and download bars for the CLI

pub mod fs;
pub mod paths;
pub mod progress;

pub use fs::atomic_write;
pub use paths::UpdateLayout;
