//! Release version parsing and ordering.
//!
//! Versions have exactly three numeric components and an optional prerelease tag,
//! e.g. `1.4.0` or `2.0.0-beta.2`. A leading `v` (as used in release tags) is
//! stripped. Build metadata (`+build.5`) is rejected so that two distinct strings
//! never compare equal.
//!
//! Ordering follows [`semver`]: major, minor, patch, then a stable release sorts
//! above any prerelease of the same triple. Prerelease tags compare identifier by
//! identifier, numerically when both identifiers are numeric and lexically
//! otherwise.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::{UpdateError, UpdateResult};

/// A parsed release version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(semver::Version);

impl Version {
    /// Parse a version string.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::InvalidVersionFormat`] when the input does not have
    /// the `MAJOR.MINOR.PATCH[-tag]` shape.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arcpress::update::Version;
    ///
    /// let v = Version::parse("v1.2.3-rc.1").unwrap();
    /// assert_eq!(v.to_string(), "1.2.3-rc.1");
    /// assert!(v.is_prerelease());
    /// assert!(Version::parse("1.2").is_err());
    /// ```
    pub fn parse(text: &str) -> UpdateResult<Self> {
        let invalid = |reason: &str| UpdateError::InvalidVersionFormat {
            input: text.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = text.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if body.is_empty() {
            return Err(invalid("empty version"));
        }
        if body.contains('+') {
            return Err(invalid("build metadata is not supported"));
        }

        let (core, tag) = match body.split_once('-') {
            Some((core, tag)) => (core, Some(tag)),
            None => (body, None),
        };
        if tag.is_some_and(str::is_empty) {
            return Err(invalid("prerelease tag is empty"));
        }

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid("expected exactly three components (MAJOR.MINOR.PATCH)"));
        }
        if parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
            return Err(invalid("components must be non-negative integers"));
        }

        semver::Version::parse(body).map(Self).map_err(|e| invalid(&e.to_string()))
    }

    #[must_use]
    pub fn major(&self) -> u64 {
        self.0.major
    }

    #[must_use]
    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    #[must_use]
    pub fn patch(&self) -> u64 {
        self.0.patch
    }

    /// The prerelease tag, if any.
    #[must_use]
    pub fn prerelease(&self) -> Option<&str> {
        if self.0.pre.is_empty() {
            None
        } else {
            Some(self.0.pre.as_str())
        }
    }

    #[must_use]
    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }

    /// The lowest possible version, used when a feed omits a minimum.
    #[must_use]
    pub const fn zero() -> Self {
        Self(semver::Version::new(0, 0, 0))
    }
}

/// Total order between two versions.
#[must_use]
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

/// Whether `candidate` is strictly newer than `current`.
#[must_use]
pub fn is_newer(candidate: &Version, current: &Version) -> bool {
    candidate > current
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Version {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}
