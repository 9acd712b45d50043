//! Shared collaborators and settings handed to every cluster actor.

use std::sync::Arc;
use std::time::Duration;

use nestplane_api::ReleaseCatalog;
use nestplane_reconcile::PollPolicy;

use crate::config::Config;
use crate::objects::ObjectApplier;
use crate::provision::{CredentialProvisioner, DatastoreProvisioner, EndpointProvisioner};
use crate::stats::ControllerStats;
use crate::store::ClusterStore;
use crate::workload::WorkloadRenderer;

/// Timings and limits for a single cluster actor.
#[derive(Debug, Clone)]
pub struct ActorSettings {
    pub base_domain: String,
    pub ingress_class: String,
    pub reconcile_interval: Duration,
    pub poll: PollPolicy,
    pub status_retry_interval: Duration,
    pub event_queue_capacity: usize,
    pub default_version: String,
}

impl Default for ActorSettings {
    fn default() -> Self {
        Config::default().actor_settings()
    }
}

/// Everything an actor needs to talk to the outside world.
///
/// One context is built at startup and shared (behind an `Arc`) by the
/// dispatcher and all actors.
pub struct ClusterContext {
    pub store: Arc<dyn ClusterStore>,
    pub datastores: Arc<dyn DatastoreProvisioner>,
    pub endpoints: Arc<dyn EndpointProvisioner>,
    pub credentials: Arc<dyn CredentialProvisioner>,
    pub renderer: Arc<dyn WorkloadRenderer>,
    pub objects: Arc<dyn ObjectApplier>,
    pub catalog: ReleaseCatalog,
    pub settings: ActorSettings,
    pub stats: Arc<ControllerStats>,
}
