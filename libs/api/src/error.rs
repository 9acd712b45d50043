//! Error types for the resource model.

use thiserror::Error;

/// Errors raised while defaulting, validating or resolving a cluster spec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The version string is not a recognized release version.
    #[error("invalid version '{value}': {reason}")]
    InvalidVersion { value: String, reason: String },

    /// The version names a release channel the catalog cannot resolve.
    #[error("unknown release channel: {0}")]
    UnknownChannel(String),

    /// Version is unset; defaulting has not run.
    #[error("spec.version is not set")]
    MissingVersion,
}

impl ApiError {
    pub(crate) fn invalid_version(value: &str, reason: impl Into<String>) -> Self {
        ApiError::InvalidVersion {
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
