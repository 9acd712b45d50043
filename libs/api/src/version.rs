//! Release versions.
//!
//! A cluster's `spec.version` is either an explicit semantic version
//! (`v1.9.3`, `1.10.0-beta.1`) or a release channel label (`stable`,
//! `stable-1.9`, `latest-1.10`, `ci/latest`). Channels are resolved to an
//! explicit version through a [`ReleaseCatalog`] before workloads are rendered.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ApiError;

/// Bucket prefixes accepted in front of a channel label.
const BUCKET_PREFIXES: [&str; 3] = ["release/", "ci/", "ci-cross/"];

/// Channel bases.
const CHANNELS: [&str; 2] = ["stable", "latest"];

// =============================================================================
// Semantic version
// =============================================================================

/// An explicit `MAJOR.MINOR.PATCH[-pre][+build]` version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SemanticVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
    pub build: Option<String>,
}

impl SemanticVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
            build: None,
        }
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl FromStr for SemanticVersion {
    type Err = ApiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.strip_prefix('v').unwrap_or(value);

        let (rest, build) = match trimmed.split_once('+') {
            Some((rest, build)) => (rest, Some(parse_identifiers(value, build)?)),
            None => (trimmed, None),
        };
        let (core, pre) = match rest.split_once('-') {
            Some((core, pre)) => (core, Some(parse_identifiers(value, pre)?)),
            None => (rest, None),
        };

        let mut parts = core.split('.');
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ApiError::invalid_version(
                value,
                "expected MAJOR.MINOR.PATCH",
            ));
        };

        Ok(Self {
            major: parse_numeric(value, major)?,
            minor: parse_numeric(value, minor)?,
            patch: parse_numeric(value, patch)?,
            pre,
            build,
        })
    }
}

impl Serialize for SemanticVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SemanticVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn parse_numeric(value: &str, part: &str) -> Result<u64, ApiError> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ApiError::invalid_version(
            value,
            format!("'{part}' is not a number"),
        ));
    }
    if part.len() > 1 && part.starts_with('0') {
        return Err(ApiError::invalid_version(
            value,
            format!("'{part}' has a leading zero"),
        ));
    }
    part.parse()
        .map_err(|_| ApiError::invalid_version(value, format!("'{part}' is out of range")))
}

fn parse_identifiers(value: &str, ids: &str) -> Result<String, ApiError> {
    let valid = !ids.is_empty()
        && ids.split('.').all(|id| {
            !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if valid {
        Ok(ids.to_string())
    } else {
        Err(ApiError::invalid_version(
            value,
            format!("'{ids}' is not a valid pre-release or build identifier"),
        ))
    }
}

// =============================================================================
// Release version
// =============================================================================

/// A parsed `spec.version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReleaseVersion {
    /// An explicit version.
    Exact(SemanticVersion),
    /// A channel label, resolved later through the catalog.
    Channel(String),
}

impl ReleaseVersion {
    pub fn is_channel(&self) -> bool {
        matches!(self, ReleaseVersion::Channel(_))
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseVersion::Exact(v) => write!(f, "{v}"),
            ReleaseVersion::Channel(label) => write!(f, "{label}"),
        }
    }
}

impl FromStr for ReleaseVersion {
    type Err = ApiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Err(ApiError::invalid_version(value, "empty"));
        }

        if value.starts_with(|c: char| c.is_ascii_digit() || c == 'v') && !is_channel(value) {
            return value.parse().map(ReleaseVersion::Exact);
        }

        if is_channel(value) {
            return Ok(ReleaseVersion::Channel(value.to_string()));
        }

        Err(ApiError::invalid_version(
            value,
            "neither a semantic version nor a release channel (stable, latest, stable-X.Y, ci/latest, ...)",
        ))
    }
}

/// `[bucket/](stable|latest)[-MAJOR[.MINOR]]`
fn is_channel(value: &str) -> bool {
    let label = BUCKET_PREFIXES
        .iter()
        .find_map(|prefix| value.strip_prefix(prefix))
        .unwrap_or(value);

    CHANNELS.iter().any(|base| match label.strip_prefix(base) {
        Some("") => true,
        Some(rest) => rest.strip_prefix('-').is_some_and(is_major_minor),
        None => false,
    })
}

fn is_major_minor(s: &str) -> bool {
    let mut parts = s.split('.');
    let numeric = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(major), None, None) => numeric(major),
        (Some(major), Some(minor), None) => numeric(major) && numeric(minor),
        _ => false,
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Maps channel labels to the explicit version they currently point at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseCatalog {
    channels: BTreeMap<String, SemanticVersion>,
}

impl Default for ReleaseCatalog {
    fn default() -> Self {
        let v1_9 = SemanticVersion::new(1, 9, 11);
        Self {
            channels: BTreeMap::from([
                ("stable".to_string(), v1_9.clone()),
                ("stable-1".to_string(), v1_9.clone()),
                ("stable-1.9".to_string(), v1_9.clone()),
                ("latest".to_string(), v1_9.clone()),
                ("latest-1.9".to_string(), v1_9),
            ]),
        }
    }
}

impl ReleaseCatalog {
    /// An empty catalog; only explicit versions resolve.
    pub fn empty() -> Self {
        Self {
            channels: BTreeMap::new(),
        }
    }

    /// Point `label` at `version`, replacing any previous target.
    pub fn with_channel(mut self, label: impl Into<String>, version: SemanticVersion) -> Self {
        self.channels.insert(label.into(), version);
        self
    }

    /// Merge `label=version` pairs separated by commas, e.g.
    /// `stable=v1.10.2,latest-1.10=v1.10.2`.
    pub fn extend_from_pairs(&mut self, pairs: &str) -> Result<(), ApiError> {
        for pair in pairs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((label, version)) = pair.split_once('=') else {
                return Err(ApiError::invalid_version(pair, "expected label=version"));
            };
            let label = label.trim();
            if !is_channel(label) {
                return Err(ApiError::invalid_version(label, "not a release channel"));
            }
            self.channels
                .insert(label.to_string(), version.trim().parse()?);
        }
        Ok(())
    }

    /// Resolve to an explicit version.
    pub fn resolve(&self, version: &ReleaseVersion) -> Result<SemanticVersion, ApiError> {
        match version {
            ReleaseVersion::Exact(v) => Ok(v.clone()),
            ReleaseVersion::Channel(label) => self
                .channels
                .get(label)
                .cloned()
                .ok_or_else(|| ApiError::UnknownChannel(label.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_explicit_versions() {
        let v: ReleaseVersion = "v1.9.3".parse().unwrap();
        assert_eq!(v, ReleaseVersion::Exact(SemanticVersion::new(1, 9, 3)));

        let v: SemanticVersion = "1.10.0-beta.1+abc".parse().unwrap();
        assert_eq!(v.pre.as_deref(), Some("beta.1"));
        assert_eq!(v.build.as_deref(), Some("abc"));
        assert_eq!(v.to_string(), "v1.10.0-beta.1+abc");
    }

    #[test]
    fn test_semantic_version_serializes_as_string() {
        let v = SemanticVersion::new(1, 9, 11);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"v1.9.11\"");
        let back: SemanticVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
        assert!(serde_json::from_str::<SemanticVersion>("\"1.9\"").is_err());
    }

    #[test]
    fn test_channels() {
        for label in [
            "stable",
            "latest",
            "stable-1",
            "stable-1.9",
            "latest-1.10",
            "ci/latest",
            "ci-cross/latest-1.9",
            "release/stable",
        ] {
            let v: ReleaseVersion = label.parse().unwrap();
            assert!(v.is_channel(), "{label} should be a channel");
            assert_eq!(v.to_string(), label);
        }
    }

    #[test]
    fn test_rejected() {
        for bad in [
            "",
            "not-a-version",
            "v1.9",
            "v1.9.3.4",
            "v01.9.3",
            "1.x.0",
            "stable-",
            "stable-1.9.3",
            "nightly",
            "v1.9.3-",
            "ci/",
        ] {
            assert!(
                bad.parse::<ReleaseVersion>().is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_catalog_resolves_default_channel() {
        let catalog = ReleaseCatalog::default();
        let resolved = catalog
            .resolve(&crate::types::DEFAULT_VERSION.parse().unwrap())
            .unwrap();
        assert_eq!(resolved, SemanticVersion::new(1, 9, 11));
    }

    #[test]
    fn test_catalog_unknown_channel() {
        let catalog = ReleaseCatalog::empty();
        let err = catalog.resolve(&"ci/latest".parse().unwrap()).unwrap_err();
        assert_eq!(err, ApiError::UnknownChannel("ci/latest".to_string()));
    }

    #[test]
    fn test_catalog_pairs() {
        let mut catalog = ReleaseCatalog::empty();
        catalog
            .extend_from_pairs("stable=v1.10.2, latest-1.10 = 1.10.3")
            .unwrap();
        assert_eq!(
            catalog.resolve(&"latest-1.10".parse().unwrap()).unwrap(),
            SemanticVersion::new(1, 10, 3)
        );
        assert!(catalog.extend_from_pairs("nightly=v1.0.0").is_err());
        assert!(catalog.extend_from_pairs("stable").is_err());
    }

    proptest! {
        #[test]
        fn prop_explicit_versions_parse(major in 0u64..100, minor in 0u64..100, patch in 0u64..100) {
            let text = format!("v{major}.{minor}.{patch}");
            let parsed: ReleaseVersion = text.parse().unwrap();
            prop_assert_eq!(parsed.to_string(), text);
        }
    }
}
