//! Release feed client.
//!
//! The feed is a JSON document served from `update_server_url`. Two shapes are
//! understood:
//!
//! 1. The native listing, either `{ "releases": [ ... ] }` or a bare array, where
//!    each entry looks like
//!    ```json
//!    {
//!      "version": "1.4.0",
//!      "download_url": "https://example.org/arcpress-1.4.0.zip",
//!      "checksum": "sha256:…",
//!      "size": 1048576,
//!      "prerelease": false,
//!      "min_supported_version": "1.0.0",
//!      "notes": "Bug fixes"
//!    }
//!    ```
//! 2. A GitHub releases listing (or a single `releases/latest` object). The first
//!    `.zip` asset with a `sha256:` digest becomes the artifact.
//!
//! Entries are validated field by field. A malformed entry is skipped with a
//! `warn!` naming the entry and the reason; only a body that is not a release
//! listing at all fails the fetch.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};

use crate::core::{UpdateError, UpdateResult};
use crate::update::Version;
use crate::update::verification::is_sha256_digest;

/// User-Agent sent with every request.
pub const USER_AGENT: &str = concat!("arcpress-updater/", env!("CARGO_PKG_VERSION"));

/// A release advertised by the feed. Never mutated after parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseCandidate {
    pub version: Version,
    pub download_url: String,
    /// SHA-256 of the artifact, lowercase hex without prefix.
    pub checksum: String,
    pub size_bytes: u64,
    pub is_prerelease: bool,
    /// Oldest running version that may upgrade directly to this release.
    pub min_supported_version: Version,
    pub notes: Option<String>,
}

/// An open artifact download.
pub struct ArtifactDownload {
    /// Length advertised by the server, if any.
    pub total_bytes: Option<u64>,
    pub chunks: BoxStream<'static, UpdateResult<Vec<u8>>>,
}

/// Source of release candidates and artifact bytes.
///
/// [`HttpReleaseFeed`] is the production implementation; tests substitute an
/// in-memory feed.
#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    /// Fetch every valid candidate from the feed, newest first.
    ///
    /// Prereleases are dropped unless `include_prereleases` is set.
    async fn fetch_candidates(
        &self,
        base_url: &str,
        include_prereleases: bool,
    ) -> UpdateResult<Vec<ReleaseCandidate>>;

    /// Open a byte stream for an artifact.
    async fn open_artifact(&self, url: &str) -> UpdateResult<ArtifactDownload>;
}

/// Why a single feed entry was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("entry is not a JSON object")]
    NotAnObject,
    #[error("missing field '{0}'")]
    Missing(&'static str),
    #[error("field '{field}' must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field '{field}' is invalid: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
    #[error("no .zip asset with a sha256 digest")]
    NoArtifact,
}

fn required_str<'a>(entry: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, FieldError> {
    match entry.get(field) {
        None | Some(Value::Null) => Err(FieldError::Missing(field)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(FieldError::Missing(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(FieldError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn optional_str<'a>(
    entry: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, FieldError> {
    match entry.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(FieldError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn optional_u64(entry: &Map<String, Value>, field: &'static str) -> Result<Option<u64>, FieldError> {
    match entry.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or(FieldError::WrongType {
            field,
            expected: "a non-negative integer",
        }),
    }
}

fn optional_bool(entry: &Map<String, Value>, field: &'static str) -> Result<Option<bool>, FieldError> {
    match entry.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(FieldError::WrongType {
            field,
            expected: "a boolean",
        }),
    }
}

fn version_field(text: &str, field: &'static str) -> Result<Version, FieldError> {
    Version::parse(text).map_err(|e| FieldError::Invalid {
        field,
        reason: e.to_string(),
    })
}

fn checksum_field(text: &str, field: &'static str) -> Result<String, FieldError> {
    if !is_sha256_digest(text) {
        return Err(FieldError::Invalid {
            field,
            reason: "expected a 64-character SHA-256 hex digest".to_string(),
        });
    }
    Ok(crate::update::verification::normalize_checksum(text))
}

fn min_supported(entry: &Map<String, Value>) -> Result<Version, FieldError> {
    optional_str(entry, "min_supported_version")?
        .map_or(Ok(Version::zero()), |text| version_field(text, "min_supported_version"))
}

fn parse_native_entry(value: &Value) -> Result<ReleaseCandidate, FieldError> {
    let entry = value.as_object().ok_or(FieldError::NotAnObject)?;

    let version = version_field(required_str(entry, "version")?, "version")?;
    let download_url = required_str(entry, "download_url")?.to_string();
    let checksum = checksum_field(required_str(entry, "checksum")?, "checksum")?;
    let size_bytes = match optional_u64(entry, "size")? {
        Some(size) => size,
        None => optional_u64(entry, "size_bytes")?.unwrap_or(0),
    };
    let is_prerelease = optional_bool(entry, "prerelease")?.unwrap_or_else(|| version.is_prerelease());

    Ok(ReleaseCandidate {
        min_supported_version: min_supported(entry)?,
        notes: optional_str(entry, "notes")?.map(str::to_string),
        version,
        download_url,
        checksum,
        size_bytes,
        is_prerelease,
    })
}

fn parse_github_entry(value: &Value) -> Result<ReleaseCandidate, FieldError> {
    let entry = value.as_object().ok_or(FieldError::NotAnObject)?;

    let version = version_field(required_str(entry, "tag_name")?, "tag_name")?;
    let is_prerelease = optional_bool(entry, "prerelease")?.unwrap_or_else(|| version.is_prerelease());
    let assets = match entry.get("assets") {
        Some(Value::Array(assets)) => assets.as_slice(),
        None | Some(Value::Null) => &[],
        Some(_) => {
            return Err(FieldError::WrongType {
                field: "assets",
                expected: "an array",
            });
        }
    };

    let (download_url, checksum, size_bytes) = assets
        .iter()
        .filter_map(Value::as_object)
        .find_map(|asset| {
            let name = optional_str(asset, "name").ok()??;
            if !name.to_ascii_lowercase().ends_with(".zip") {
                return None;
            }
            let digest = optional_str(asset, "digest").ok()??;
            let (algorithm, _) = digest.split_once(':')?;
            if !algorithm.eq_ignore_ascii_case("sha256") || !is_sha256_digest(digest) {
                return None;
            }
            let url = optional_str(asset, "browser_download_url").ok()??;
            let size = optional_u64(asset, "size").ok()?.unwrap_or(0);
            Some((
                url.to_string(),
                crate::update::verification::normalize_checksum(digest),
                size,
            ))
        })
        .ok_or(FieldError::NoArtifact)?;

    Ok(ReleaseCandidate {
        min_supported_version: min_supported(entry)?,
        notes: optional_str(entry, "body")?.filter(|b| !b.is_empty()).map(str::to_string),
        version,
        download_url,
        checksum,
        size_bytes,
        is_prerelease,
    })
}

fn is_github_entry(value: &Value) -> bool {
    value.as_object().is_some_and(|entry| entry.contains_key("tag_name"))
}

/// Parse a feed body into candidates, newest first.
///
/// # Errors
///
/// Returns [`UpdateError::FeedParseError`] if the body is not JSON or not one
/// of the accepted listing shapes. Individual bad entries do not fail the parse.
pub fn parse_feed(body: &str, url: &str, include_prereleases: bool) -> UpdateResult<Vec<ReleaseCandidate>> {
    let parse_error = |reason: String| UpdateError::FeedParseError {
        url: url.to_string(),
        reason,
    };

    if body.trim().is_empty() {
        debug!("Release feed at {} is empty", url);
        return Ok(Vec::new());
    }

    let document: Value = serde_json::from_str(body).map_err(|e| parse_error(e.to_string()))?;

    let single;
    let entries: &[Value] = match &document {
        Value::Array(entries) => entries,
        Value::Object(map) => match map.get("releases") {
            Some(Value::Array(entries)) => entries,
            Some(_) => return Err(parse_error("'releases' must be an array".to_string())),
            None if map.contains_key("tag_name") => {
                single = [document.clone()];
                &single
            }
            None => return Err(parse_error("expected a 'releases' array".to_string())),
        },
        _ => return Err(parse_error("expected a JSON object or array".to_string())),
    };

    let mut candidates = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let parsed = if is_github_entry(entry) {
            parse_github_entry(entry)
        } else {
            parse_native_entry(entry)
        };

        match parsed {
            Ok(candidate) if candidate.is_prerelease && !include_prereleases => {
                debug!("Skipping prerelease {}", candidate.version);
            }
            Ok(candidate) => candidates.push(candidate),
            Err(reason) => {
                warn!(entry = index, feed = url, "Skipping malformed feed entry: {}", reason);
            }
        }
    }

    candidates.sort_by(|a, b| b.version.cmp(&a.version));
    Ok(candidates)
}

/// [`ReleaseFeed`] over HTTP(S), with `file://` support for local mirrors.
pub struct HttpReleaseFeed {
    client: reqwest::Client,
    retries: usize,
}

impl HttpReleaseFeed {
    /// Create a feed client that retries transport failures `retries` times.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::NetworkError`] if the HTTP client cannot be built.
    pub fn new(retries: usize) -> UpdateResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| UpdateError::network("client setup", None, e.to_string()))?;
        Ok(Self {
            client,
            retries,
        })
    }

    fn file_path(url: &str) -> UpdateResult<Option<PathBuf>> {
        if !url.starts_with("file://") {
            return Ok(None);
        }
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| UpdateError::network("resolve file url", None, e.to_string()))?;
        parsed
            .to_file_path()
            .map(Some)
            .map_err(|()| UpdateError::network("resolve file url", None, format!("not a local path: {url}")))
    }

    async fn get_text(&self, url: &str) -> UpdateResult<String> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| UpdateError::network("feed fetch", None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::network(
                "feed fetch",
                Some(status.as_u16()),
                status.canonical_reason().unwrap_or("request failed").to_string(),
            ));
        }

        response
            .text()
            .await
            .map_err(|e| UpdateError::network("feed fetch", Some(status.as_u16()), e.to_string()))
    }
}

#[async_trait]
impl ReleaseFeed for HttpReleaseFeed {
    async fn fetch_candidates(
        &self,
        base_url: &str,
        include_prereleases: bool,
    ) -> UpdateResult<Vec<ReleaseCandidate>> {
        info!("Fetching release feed from {}", base_url);

        let body = if let Some(path) = Self::file_path(base_url)? {
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| UpdateError::network("feed fetch", None, format!("{}: {e}", path.display())))?
        } else {
            let strategy = ExponentialBackoff::from_millis(10)
                .factor(20)
                .max_delay(Duration::from_secs(2))
                .take(self.retries);

            RetryIf::spawn(
                strategy,
                || self.get_text(base_url),
                |e: &UpdateError| {
                    let retry = e.is_transient();
                    if retry {
                        debug!("Retrying feed fetch after: {}", e);
                    }
                    retry
                },
            )
            .await?
        };

        let candidates = parse_feed(&body, base_url, include_prereleases)?;
        debug!("Feed returned {} candidate(s)", candidates.len());
        Ok(candidates)
    }

    async fn open_artifact(&self, url: &str) -> UpdateResult<ArtifactDownload> {
        if let Some(path) = Self::file_path(url)? {
            let file = tokio::fs::File::open(&path).await.map_err(|e| {
                UpdateError::network("artifact download", None, format!("{}: {e}", path.display()))
            })?;
            let total_bytes = file.metadata().await.ok().map(|m| m.len());
            let chunks = tokio_util::io::ReaderStream::new(file)
                .map(|chunk| {
                    chunk
                        .map(|bytes| bytes.to_vec())
                        .map_err(|e| UpdateError::network("artifact download", None, e.to_string()))
                })
                .boxed();
            return Ok(ArtifactDownload {
                total_bytes,
                chunks,
            });
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::network("artifact download", None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::network(
                "artifact download",
                Some(status.as_u16()),
                status.canonical_reason().unwrap_or("request failed").to_string(),
            ));
        }

        let total_bytes = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| UpdateError::network("artifact download", None, e.to_string()))
            })
            .boxed();

        Ok(ArtifactDownload {
            total_bytes,
            chunks,
        })
    }
}
