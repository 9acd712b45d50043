//! Controller and actor error types.

use nestplane_api::{ApiError, ClusterPhase, WatchEventType};
use nestplane_reconcile::{PollError, ReconcileError};
use thiserror::Error;

/// Errors returned by the dispatcher for a single notification.
///
/// None of these stop the dispatcher; the offending event is dropped.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The registry disagrees with the notification (duplicate add, or a
    /// modify/delete for a name with no actor).
    #[error("unsafe state: cluster ({name}) {detail} but we received event ({event})")]
    UnsafeState {
        name: String,
        event: WatchEventType,
        detail: &'static str,
    },

    /// The spec failed defaulting/validation; the cluster stays unmanaged.
    #[error("invalid cluster spec for ({name}), please fix: {source}")]
    Validation {
        name: String,
        #[source]
        source: ApiError,
    },

    /// The cluster is Failed; only deletion is accepted.
    #[error("ignoring failed cluster ({0}); delete its resource to clean up")]
    FailedCluster(String),
}

impl ControllerError {
    pub(crate) fn already_created(name: &str) -> Self {
        ControllerError::UnsafeState {
            name: name.to_string(),
            event: WatchEventType::Added,
            detail: "was created before",
        }
    }

    pub(crate) fn never_created(name: &str, event: WatchEventType) -> Self {
        ControllerError::UnsafeState {
            name: name.to_string(),
            event,
            detail: "was never created",
        }
    }

    pub fn is_unsafe_state(&self) -> bool {
        matches!(self, ControllerError::UnsafeState { .. })
    }
}

/// Create workflow step, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStep {
    Datastore,
    Endpoint,
    Configuration,
    Credentials,
    Workloads,
    Route,
}

impl std::fmt::Display for CreateStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CreateStep::Datastore => "datastore",
            CreateStep::Endpoint => "network endpoint",
            CreateStep::Configuration => "control-plane configuration",
            CreateStep::Credentials => "credentials",
            CreateStep::Workloads => "control-plane workloads",
            CreateStep::Route => "route",
        };
        write!(f, "{}", s)
    }
}

/// Failures that move a cluster to `Failed`.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A previous run stopped mid-creation; the partial state is ambiguous.
    #[error("cluster was found in phase Creating at startup; refusing to resume a partial creation")]
    CreatingOnStartup,

    #[error("unexpected cluster phase: {0}")]
    UnexpectedPhase(ClusterPhase),

    /// A bounded readiness wait ran out of time.
    #[error("{step}: {source}")]
    ProvisioningTimeout {
        step: CreateStep,
        #[source]
        source: ReconcileError,
    },

    /// A provisioning call failed.
    #[error("{step}: {source:#}")]
    Provisioning {
        step: CreateStep,
        #[source]
        source: anyhow::Error,
    },

    /// Handling a spec update failed.
    #[error("handle update event failed: {0:#}")]
    Update(anyhow::Error),
}

impl ClusterError {
    pub(crate) fn at(step: CreateStep) -> impl FnOnce(anyhow::Error) -> ClusterError {
        move |source| ClusterError::Provisioning { step, source }
    }

    pub(crate) fn from_poll(step: CreateStep, err: PollError<anyhow::Error>) -> ClusterError {
        match err {
            PollError::Timeout { .. } => ClusterError::ProvisioningTimeout {
                step,
                source: err.into(),
            },
            PollError::Check { error, .. } => ClusterError::Provisioning {
                step,
                source: error,
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterError::ProvisioningTimeout { .. })
    }
}
