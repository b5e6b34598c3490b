//! Error handling for the arcpress update engine.
//!
//! Two layers, mirroring how the rest of the crate is written:
//!
//! - [`UpdateError`]: a strongly-typed `thiserror` enum returned by everything in
//!   [`crate::update`]. Each variant keeps the low-level cause (an
//!   [`std::io::Error`], an HTTP status, a parser message) so nothing is replaced
//!   by a generic message on the way up.
//! - [`ErrorContext`]: the user-facing rendering used by the CLI. It pairs a
//!   message with an optional suggestion and details, and knows which exit code a
//!   failure maps to.
//!
//! # Taxonomy
//!
//! | Variant | Raised by | Typical cause |
//! |---------|-----------|---------------|
//! | `InvalidVersionFormat` | version parser | malformed feed or descriptor version |
//! | `NetworkError` | release feed | connection refused, timeout, HTTP 5xx |
//! | `FeedParseError` | release feed | body is not JSON / not a release listing |
//! | `ChecksumMismatch` | integrity verifier | corrupted or tampered download |
//! | `ReadError` | integrity verifier | artifact vanished or unreadable |
//! | `InsufficientSpace` | backup manager | backup volume is full |
//! | `Io` | backup / apply | permission denied, file locked, disk full |
//! | `IncompatibleUpdate` | orchestrator | running version below the candidate's minimum |
//! | `RollbackFailed` | orchestrator | restore after a failed apply did not complete |

use colored::Colorize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Every failure the update engine can report.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// A version string did not have the `MAJOR.MINOR.PATCH[-tag]` shape.
    #[error("Invalid version format '{input}': {reason}")]
    InvalidVersionFormat {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Transport failure, timeout or HTTP error status while talking to the
    /// release server.
    #[error("Network error during {operation}{}: {reason}", status_suffix(.status))]
    NetworkError {
        /// What was being attempted ("feed fetch", "artifact download").
        operation: String,
        /// HTTP status code, when the server answered.
        status: Option<u16>,
        /// Low-level cause.
        reason: String,
    },

    /// The feed body could not be interpreted as a release listing at all.
    #[error("Failed to parse release feed from {url}: {reason}")]
    FeedParseError {
        /// Feed URL.
        url: String,
        /// Parser message.
        reason: String,
    },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Failed to read {path}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Insufficient space in {path}: {required} bytes required, {available} bytes available"
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// Generic file-system failure while backing up, applying or restoring.
    #[error("Failed to {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The candidate requires a newer running version than the one installed.
    #[error(
        "Update {candidate} requires at least version {required}, but {current} is installed"
    )]
    IncompatibleUpdate {
        candidate: String,
        required: String,
        current: String,
    },

    /// Restoring the backup after a failed apply did not complete. Automatic
    /// recovery is exhausted at this point.
    #[error("Rollback from {} failed: {reason}", backup_path.display())]
    RollbackFailed {
        backup_path: PathBuf,
        reason: String,
    },

    /// The downloaded artifact is not a usable update package.
    #[error("Invalid update artifact {path}: {reason}")]
    InvalidArtifact {
        path: PathBuf,
        reason: String,
    },

    /// The caller tried to start an update without accepting a known risk.
    #[error("Update not started: {risk}")]
    RiskNotAcknowledged {
        risk: String,
    },

    #[error("No update session with id {session_id}")]
    SessionNotFound {
        session_id: String,
    },

    #[error("Cannot {action} while session is {state}")]
    InvalidTransition {
        state: String,
        action: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
    },

    /// The session was cancelled by the caller.
    #[error("Update cancelled during {operation}")]
    Cancelled {
        operation: String,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" (HTTP {code})")).unwrap_or_default()
}

/// Coarse classification of an [`UpdateError`], cheap to copy into session
/// snapshots and to match on in front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidVersionFormat,
    NetworkError,
    FeedParseError,
    ChecksumMismatch,
    ReadError,
    InsufficientSpace,
    IoError,
    IncompatibleUpdate,
    RollbackFailed,
    InvalidArtifact,
    RiskNotAcknowledged,
    SessionNotFound,
    InvalidTransition,
    Config,
    Cancelled,
}

impl UpdateError {
    /// Shorthand for [`UpdateError::Io`].
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    pub fn network(operation: impl Into<String>, status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::NetworkError {
            operation: operation.into(),
            status,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidVersionFormat {
                ..
            } => ErrorKind::InvalidVersionFormat,
            Self::NetworkError {
                ..
            } => ErrorKind::NetworkError,
            Self::FeedParseError {
                ..
            } => ErrorKind::FeedParseError,
            Self::ChecksumMismatch {
                ..
            } => ErrorKind::ChecksumMismatch,
            Self::ReadError {
                ..
            } => ErrorKind::ReadError,
            Self::InsufficientSpace {
                ..
            } => ErrorKind::InsufficientSpace,
            Self::Io {
                ..
            } => ErrorKind::IoError,
            Self::IncompatibleUpdate {
                ..
            } => ErrorKind::IncompatibleUpdate,
            Self::RollbackFailed {
                ..
            } => ErrorKind::RollbackFailed,
            Self::InvalidArtifact {
                ..
            } => ErrorKind::InvalidArtifact,
            Self::RiskNotAcknowledged {
                ..
            } => ErrorKind::RiskNotAcknowledged,
            Self::SessionNotFound {
                ..
            } => ErrorKind::SessionNotFound,
            Self::InvalidTransition {
                ..
            } => ErrorKind::InvalidTransition,
            Self::Config {
                ..
            } => ErrorKind::Config,
            Self::Cancelled {
                ..
            } => ErrorKind::Cancelled,
        }
    }

    /// A transport failure that may succeed when retried. An HTTP status is a
    /// definite answer and is not transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkError {
                status: None,
                ..
            }
        )
    }

    /// The error message followed by every `source()` in the chain, so the
    /// low-level cause survives when the error is flattened into a string.
    #[must_use]
    pub fn full_message(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }
}

/// User-facing rendering of a failure with an optional suggestion and details.
///
/// Built by [`user_friendly_error`] for errors bubbling out of a command, or by
/// [`ErrorContext::for_session`] for a session that ended `Failed`.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub message: String,
    pub kind: Option<ErrorKind>,
    pub suggestion: Option<String>,
    pub details: Option<String>,
}

impl ErrorContext {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            suggestion: None,
            details: None,
        }
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Context for a session that ended in failure.
    ///
    /// `backup_path` is the snapshot taken for the session, if any; it is named in
    /// the guidance whenever manual recovery may be needed.
    #[must_use]
    pub fn for_session(kind: ErrorKind, message: &str, backup_path: Option<&std::path::Path>) -> Self {
        let ctx = Self::new(message).with_kind(kind);
        match kind {
            ErrorKind::RollbackFailed => {
                let location = backup_path
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "the backup directory".to_string());
                ctx.with_suggestion(format!(
                    "Automatic recovery failed. Copy the files from {location} back into the installation directory manually"
                ))
                .with_details("The installation may be inconsistent until it is restored")
            }
            ErrorKind::NetworkError => ctx
                .with_suggestion("Check your network connection and the update_server_url setting, then retry"),
            ErrorKind::ChecksumMismatch | ErrorKind::ReadError | ErrorKind::InvalidArtifact => ctx
                .with_suggestion("The download was discarded and nothing was changed. Retry the update")
                .with_details("A corrupted or incomplete download is the usual cause"),
            ErrorKind::IncompatibleUpdate => ctx.with_suggestion(
                "Install an intermediate release first, or reinstall from the project's download page",
            ),
            ErrorKind::InsufficientSpace => {
                ctx.with_suggestion("Free some disk space or remove old backups, then retry")
            }
            ErrorKind::IoError => match backup_path {
                Some(path) => ctx
                    .with_suggestion("Close other running copies of the application and retry")
                    .with_details(format!("The previous installation was restored from {}", path.display())),
                None => ctx.with_suggestion(
                    "No backup was taken for this update; reinstall the application if it no longer starts",
                ),
            },
            _ => ctx,
        }
    }

    /// Process exit code for this failure: 2 when rollback failed, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.kind == Some(ErrorKind::RollbackFailed) {
            2
        } else {
            1
        }
    }

    /// Print the context to stderr.
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.message);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Convert an error escaping a command into an [`ErrorContext`].
///
/// An [`ErrorContext`] returned as the error is passed through unchanged.
/// [`UpdateError`]s get the same guidance as failed sessions; anything else is
/// rendered with its full `anyhow` cause chain.
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    let error = match error.downcast::<ErrorContext>() {
        Ok(ctx) => return ctx,
        Err(other) => other,
    };
    let error = match error.downcast::<UpdateError>() {
        Ok(update_error) => {
            let backup = match &update_error {
                UpdateError::RollbackFailed {
                    backup_path,
                    ..
                } => Some(backup_path.clone()),
                _ => None,
            };
            return ErrorContext::for_session(
                update_error.kind(),
                &update_error.full_message(),
                backup.as_deref(),
            );
        }
        Err(other) => other,
    };

    if let Some(io_error) = error.downcast_ref::<std::io::Error>()
        && io_error.kind() == std::io::ErrorKind::PermissionDenied
    {
        return ErrorContext::new(error.to_string())
            .with_kind(ErrorKind::IoError)
            .with_suggestion("Check that you can write to the installation directory")
            .with_details("Updating requires write access to every installed file");
    }

    let mut message = error.to_string();
    let chain: Vec<String> = error.chain().skip(1).map(ToString::to_string).collect();
    if !chain.is_empty() {
        message.push_str("\n\nCaused by:");
        for (i, cause) in chain.iter().enumerate() {
            message.push_str(&format!("\n  {}: {}", i + 1, cause));
        }
    }

    ErrorContext::new(message)
}
