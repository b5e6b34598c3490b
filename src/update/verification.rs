//! Integrity verification for downloaded artifacts and backed-up files.
//!
//! Files are streamed through SHA-256 in fixed-size chunks, so memory use does
//! not depend on artifact size. Checksums are lowercase hex; an optional
//! `sha256:` prefix is tolerated on expected values and comparison is
//! case-insensitive.

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::core::{UpdateError, UpdateResult};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// SHA-256 checksum computation and verification.
pub struct ChecksumVerifier;

impl ChecksumVerifier {
    /// Compute the SHA-256 checksum of a file as lowercase hex.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ReadError`] if the file cannot be opened or read.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use arcpress::update::ChecksumVerifier;
    /// use std::path::Path;
    ///
    /// # async fn example() -> arcpress::core::UpdateResult<()> {
    /// let checksum = ChecksumVerifier::compute_sha256(Path::new("arcpress-1.4.0.zip")).await?;
    /// assert_eq!(checksum.len(), 64);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn compute_sha256(file_path: &Path) -> UpdateResult<String> {
        debug!("Computing SHA256 checksum for: {:?}", file_path);

        let read_error = |source| UpdateError::ReadError {
            path: file_path.to_path_buf(),
            source,
        };

        let mut file = tokio::fs::File::open(file_path).await.map_err(read_error)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

        loop {
            let read = file.read(&mut buffer).await.map_err(read_error)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Verify a file against an expected SHA-256 checksum.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::ReadError`] if the file cannot be read
    /// - [`UpdateError::ChecksumMismatch`] if the digest differs
    pub async fn verify(file_path: &Path, expected: &str) -> UpdateResult<()> {
        info!("Verifying checksum for: {:?}", file_path);

        let actual = Self::compute_sha256(file_path).await?;
        let expected = normalize_checksum(expected);

        if actual != expected {
            return Err(UpdateError::ChecksumMismatch {
                path: file_path.to_path_buf(),
                expected,
                actual,
            });
        }

        info!("Checksum verification successful");
        Ok(())
    }
}

/// Strip an optional `sha256:` prefix and lowercase the digest.
#[must_use]
pub fn normalize_checksum(checksum: &str) -> String {
    let trimmed = checksum.trim();
    let digest = trimmed
        .get(..7)
        .filter(|prefix| prefix.eq_ignore_ascii_case("sha256:"))
        .map_or(trimmed, |_| &trimmed[7..]);
    digest.to_ascii_lowercase()
}

/// Whether `text` looks like a SHA-256 digest (64 hex chars, prefix allowed).
#[must_use]
pub fn is_sha256_digest(text: &str) -> bool {
    let digest = normalize_checksum(text);
    digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit())
}
