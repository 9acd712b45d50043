//! The `Cluster` resource.

use nestplane_id::ClusterUid;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::labels::Labels;
use crate::version::ReleaseVersion;

/// Version assigned when a cluster is created without one.
pub const DEFAULT_VERSION: &str = "stable-1.9";

/// Longest name usable as a DNS label in the public hostname.

// =============================================================================
// Metadata
// =============================================================================

/// Identity and concurrency token of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,

    pub namespace: String,

    /// Stable identity, unchanged for the life of the resource. Assigned
    /// fresh when absent.
    #[serde(default)]
    pub uid: ClusterUid,

    /// Bumped by the store on every accepted write. A write based on an older
    /// value is rejected as a conflict.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
}

// =============================================================================
// Spec
// =============================================================================

/// Desired state of a nested control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Release version or channel label, e.g. `v1.9.3` or `stable-1.9`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Suspends periodic control while set.
    #[serde(default)]
    pub paused: bool,
}

impl ClusterSpec {
    /// Compares only the fields the controller acts on.
    ///
    /// Other fields may be added to the spec later as immutable-after-create;
    /// changes to them never reach the actor's decision logic.
    pub fn semantically_equal(&self, other: &ClusterSpec) -> bool {
        self.paused == other.paused && self.version == other.version
    }
}

// =============================================================================
// Status
// =============================================================================

/// Coarse lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterPhase {
    #[default]
    #[serde(rename = "")]
    None,
    Creating,
    Running,
    Failed,
}

impl ClusterPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterPhase::None => "",
            ClusterPhase::Creating => "Creating",
            ClusterPhase::Running => "Running",
            ClusterPhase::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::None => write!(f, "None"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Observed state, written by the owning actor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human-readable cause of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// True while the spec's `paused` flag suspends control.
    #[serde(default)]
    pub control_paused: bool,
}

impl ClusterStatus {
    pub fn set_phase(&mut self, phase: ClusterPhase) {
        self.phase = phase;
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    pub fn pause_control(&mut self) {
        self.control_paused = true;
    }

    pub fn control(&mut self) {
        self.control_paused = false;
    }

    pub fn is_failed(&self) -> bool {
        self.phase == ClusterPhase::Failed
    }
}

// =============================================================================
// Resource
// =============================================================================

/// A declarative nested control-plane instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterResource {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: ClusterSpec,

    #[serde(default)]
    pub status: ClusterStatus,
}

impl ClusterResource {
    /// A fresh resource with a new uid and no spec or status.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                uid: ClusterUid::new(),
                resource_version: 0,
                labels: Labels::new(),
            },
            spec: ClusterSpec::default(),
            status: ClusterStatus::default(),
        }
    }

    /// Builder-style version setter.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.spec.version = Some(version.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// `namespace/name`, for logs.
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    /// Public hostname: `<name>.<namespace>.<base-domain>`.
    pub fn hostname(&self, base_domain: &str) -> String {
        format!(
            "{}.{}.{}",
            self.metadata.name, self.metadata.namespace, base_domain
        )
    }

    /// Fill unset spec fields. Returns true if anything changed.
    pub fn set_defaults(&mut self, default_version: &str) -> bool {
        let mut changed = false;
        if self.spec.version.as_deref().map_or(true, str::is_empty) {
            self.spec.version = Some(default_version.to_string());
            changed = true;
        }
        changed
    }

    /// Validate the spec, returning the parsed release version.
    pub fn validate(&self) -> Result<ReleaseVersion, ApiError> {
        let version = self.spec.version.as_deref().ok_or(ApiError::MissingVersion)?;
        version.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_version() {
        let mut cluster = ClusterResource::new("db1", "team-a");
        assert!(cluster.set_defaults(DEFAULT_VERSION));
        assert_eq!(cluster.spec.version.as_deref(), Some("stable-1.9"));
        assert!(!cluster.set_defaults(DEFAULT_VERSION));
    }

    #[test]
    fn test_defaults_fill_empty_version() {
        let mut cluster = ClusterResource::new("db1", "team-a").with_version("");
        assert!(cluster.set_defaults(DEFAULT_VERSION));
        assert_eq!(cluster.spec.version.as_deref(), Some(DEFAULT_VERSION));
    }

    #[test]
    fn test_defaults_keep_explicit_version() {
        let mut cluster = ClusterResource::new("db1", "team-a").with_version("v1.10.2");
        assert!(!cluster.set_defaults(DEFAULT_VERSION));
        assert_eq!(cluster.spec.version.as_deref(), Some("v1.10.2"));
    }

    #[test]
    fn test_validate_rejects_garbage_version() {
        let cluster = ClusterResource::new("db1", "team-a").with_version("not-a-version");
        assert!(matches!(
            cluster.validate(),
            Err(ApiError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn test_validate_requires_version() {
        let cluster = ClusterResource::new("db1", "team-a");
        assert_eq!(cluster.validate(), Err(ApiError::MissingVersion));
    }

    #[test]
    fn test_validate_checks_only_the_version() {
        let cluster = ClusterResource::new("db.prod", "team-a").with_version("v1.9.0");
        assert!(cluster.validate().is_ok());
    }

    #[test]
    fn test_hostname() {
        let cluster = ClusterResource::new("db1", "team-a");
        assert_eq!(cluster.hostname("example.com"), "db1.team-a.example.com");
    }

    #[test]
    fn test_semantic_equality_tracks_paused_and_version() {
        let a = ClusterSpec {
            version: Some("v1.9.0".to_string()),
            paused: false,
        };
        let mut b = a.clone();
        assert!(a.semantically_equal(&b));

        b.paused = true;
        assert!(!a.semantically_equal(&b));

        b.paused = false;
        b.version = Some("v1.9.1".to_string());
        assert!(!a.semantically_equal(&b));
    }

    #[test]
    fn test_phase_serializes_like_the_resource_schema() {
        assert_eq!(serde_json::to_string(&ClusterPhase::None).unwrap(), "\"\"");
        assert_eq!(
            serde_json::to_string(&ClusterPhase::Running).unwrap(),
            "\"Running\""
        );
        let phase: ClusterPhase = serde_json::from_str("\"Failed\"").unwrap();
        assert_eq!(phase, ClusterPhase::Failed);
    }

    #[test]
    fn test_status_helpers() {
        let mut status = ClusterStatus::default();
        status.pause_control();
        assert!(status.control_paused);
        status.control();
        assert!(!status.control_paused);

        status.set_reason("datastore timeout");
        status.set_phase(ClusterPhase::Failed);
        assert!(status.is_failed());
        assert_eq!(status.reason.as_deref(), Some("datastore timeout"));
    }
}
