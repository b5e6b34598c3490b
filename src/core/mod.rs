//! Core types shared by every part of arcpress.
//!
//! Currently this is the error layer:
//! - [`UpdateError`] - every failure mode of the update engine, with the
//!   low-level cause attached
//! - [`ErrorKind`] - a copyable classification carried in session snapshots
//! - [`ErrorContext`] - user-facing rendering with suggestions and an exit code
//! - [`user_friendly_error`] - turn any `anyhow::Error` into an [`ErrorContext`]
//!
//! # Examples
//!
//! ```rust
//! use arcpress::core::{ErrorKind, UpdateError, user_friendly_error};
//!
//! let error = UpdateError::network("feed fetch", Some(502), "bad gateway");
//! assert_eq!(error.kind(), ErrorKind::NetworkError);
//!
//! let ctx = user_friendly_error(error.into());
//! assert_eq!(ctx.exit_code(), 1);
//! ```

pub mod error;

pub use error::{ErrorContext, ErrorKind, UpdateError, user_friendly_error};

/// Result type used throughout [`crate::update`].
pub type UpdateResult<T> = std::result::Result<T, UpdateError>;
