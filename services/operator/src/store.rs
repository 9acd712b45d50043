//! Access to the authoritative copy of cluster resources.

use async_trait::async_trait;
use nestplane_api::ClusterResource;
use nestplane_reconcile::ReconcileError;

/// Read/write access to cluster resources.
///
/// `update` is a conditional write: it must fail with
/// [`ReconcileError::Conflict`] when the stored `resource_version` differs
/// from the one carried by the argument, and with
/// [`ReconcileError::NotFound`] when the resource no longer exists.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch the latest copy of a resource.
    async fn get(&self, namespace: &str, name: &str) -> Result<ClusterResource, ReconcileError>;

    /// Replace a resource, returning the stored copy with its new version.
    async fn update(&self, resource: &ClusterResource) -> Result<ClusterResource, ReconcileError>;
}
