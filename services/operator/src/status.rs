//! Status persistence with optimistic concurrency.

use std::sync::Arc;

use nestplane_api::{ClusterResource, ClusterStatus};
use nestplane_reconcile::ReconcileError;
use tracing::debug;

use crate::store::ClusterStore;

/// Writes an actor's observed status back onto its resource.
#[derive(Clone)]
pub struct StatusPersister {
    store: Arc<dyn ClusterStore>,
}

impl StatusPersister {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    /// Read the current copy of a resource.
    pub async fn get_latest(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ClusterResource, ReconcileError> {
        self.store.get(namespace, name).await
    }

    /// Persist `status` onto `held`.
    ///
    /// Returns `Ok(false)` without a write when `held` already carries an
    /// equal status. On success `held` is replaced by the stored copy, so
    /// the next write is based on the new version. On error `held` is left
    /// untouched.
    pub async fn persist(
        &self,
        held: &mut ClusterResource,
        status: &ClusterStatus,
    ) -> Result<bool, ReconcileError> {
        if held.status == *status {
            return Ok(false);
        }

        let mut next = held.clone();
        next.status = status.clone();

        let stored = self.store.update(&next).await?;
        debug!(
            cluster = %stored.key(),
            resource_version = stored.metadata.resource_version,
            phase = %stored.status.phase,
            "Persisted cluster status"
        );
        *held = stored;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryClusterStore;
    use nestplane_api::ClusterPhase;

    #[tokio::test]
    async fn test_persist_skips_unchanged_status() {
        let store = Arc::new(MemoryClusterStore::new());
        let mut held = store.insert(ClusterResource::new("db1", "team-a")).await;
        let persister = StatusPersister::new(store.clone());

        let status = held.status.clone();
        assert!(!persister.persist(&mut held, &status).await.unwrap());
        assert_eq!(store.update_calls(), 0);
    }

    #[tokio::test]
    async fn test_persist_advances_resource_version() {
        let store = Arc::new(MemoryClusterStore::new());
        let mut held = store.insert(ClusterResource::new("db1", "team-a")).await;
        let before = held.metadata.resource_version;
        let persister = StatusPersister::new(store.clone());

        let mut status = held.status.clone();
        status.set_phase(ClusterPhase::Running);
        assert!(persister.persist(&mut held, &status).await.unwrap());

        assert!(held.metadata.resource_version > before);
        assert_eq!(held.status.phase, ClusterPhase::Running);
        let stored = persister.get_latest("team-a", "db1").await.unwrap();
        assert_eq!(stored, held);
    }

    #[tokio::test]
    async fn test_persist_rejects_stale_version() {
        let store = Arc::new(MemoryClusterStore::new());
        let mut held = store.insert(ClusterResource::new("db1", "team-a")).await;
        store
            .modify("team-a", "db1", |r| {
                r.metadata.labels.insert("owner".into(), "ops".into());
            })
            .await
            .unwrap();
        let persister = StatusPersister::new(store.clone());

        let mut status = held.status.clone();
        status.set_phase(ClusterPhase::Running);
        let stale = held.clone();
        let err = persister.persist(&mut held, &status).await.unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(held, stale);
    }

    #[tokio::test]
    async fn test_persist_reports_missing_resource() {
        let store = Arc::new(MemoryClusterStore::new());
        let mut held = store.insert(ClusterResource::new("db1", "team-a")).await;
        store.remove("team-a", "db1").await;
        let persister = StatusPersister::new(store.clone());

        let mut status = held.status.clone();
        status.set_phase(ClusterPhase::Failed);
        let err = persister.persist(&mut held, &status).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
