//! CLI integration tests for `arcpress update`.
//!
//! Each test builds an installation, an isolated `ARCPRESS_HOME` and a local
//! release feed, then drives the real binary against `file://` URLs.
//!
//! ```bash
//! cargo test --test integration
//! ```

#[path = "../common/mod.rs"]
mod common;

mod apply;
mod check;
mod history;
mod rollback;
