//! Configuration management for arcpress.
//!
//! Settings live in a single TOML file, `<state_dir>/config.toml`, where the
//! state directory is `$ARCPRESS_HOME` or `~/.arcpress`. The CLI's `--config`
//! flag points at a different file.
//!
//! # Modules
//!
//! - `global` - loading, validating and saving the file
//!
//! The `[updates]` section deserializes into [`crate::update::UpdateConfig`];
//! unknown keys are ignored so older binaries can read newer files.

mod global;

pub use global::{CONFIG_FILE, GlobalConfig};
