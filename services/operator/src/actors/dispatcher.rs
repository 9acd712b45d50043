//! Dispatcher - maps cluster lifecycle notifications onto cluster actors.
//!
//! The dispatcher owns the name → actor registry. It is the only writer of
//! that registry and handles one notification at a time, so at most one
//! actor exists per cluster name.
//!
//! ## Event translation
//!
//! ```text
//! ADDED     unknown name  → default, validate, spawn ClusterActor
//!           known name    → UnsafeState
//! MODIFIED  known name    → default, validate, enqueue snapshot
//!           unknown name  → UnsafeState
//! DELETED   known name    → teardown, stop, remove
//!           unknown name  → UnsafeState
//! ```
//!
//! A cluster whose snapshot or actor is `Failed` accepts only `DELETED`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nestplane_api::{ClusterPhase, ClusterResource, WatchEvent, WatchEventType};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::cluster::ClusterHandle;
use crate::context::ClusterContext;
use crate::error::ControllerError;
use crate::stats::StatsSnapshot;

/// Handling a single notification for longer than this logs a warning.
pub const SLOW_EVENT_THRESHOLD: Duration = Duration::from_secs(60);

/// How long `shutdown` waits for actors before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// =============================================================================
// Dispatcher
// =============================================================================

/// Root of the controller: one cluster actor per resource name.
pub struct Dispatcher {
    /// Collaborators handed to every actor.
    context: Arc<ClusterContext>,

    /// Cluster actors by resource name.
    clusters: HashMap<String, ClusterHandle>,

    /// How long `shutdown` waits for actors before aborting them.
    shutdown_grace: Duration,
}

impl Dispatcher {
    pub fn new(context: Arc<ClusterContext>) -> Self {
        Self {
            context,
            clusters: HashMap::new(),
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    /// Override how long `shutdown` waits for actors to stop.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Handle one lifecycle notification.
    ///
    /// An error means this notification was dropped; the dispatcher and all
    /// other actors are unaffected.
    pub async fn handle(&mut self, event: WatchEvent) -> Result<(), ControllerError> {
        let started = Instant::now();
        let name = event.name().to_string();
        let event_type = event.event_type;

        let result = self.handle_event(event).await;

        let elapsed = started.elapsed();
        if elapsed > SLOW_EVENT_THRESHOLD {
            warn!(
                cluster = %name,
                event = %event_type,
                elapsed_secs = elapsed.as_secs(),
                "Handling cluster event took too long"
            );
        }
        result
    }

    /// Add-or-update, for sources that cannot tell an add from a
    /// re-delivery (re-list after a restart, resync).
    pub async fn sync(&mut self, resource: ClusterResource) -> Result<(), ControllerError> {
        let event = if self.clusters.contains_key(resource.name()) {
            WatchEvent::modified(resource)
        } else {
            WatchEvent::added(resource)
        };
        self.handle(event).await
    }

    async fn handle_event(&mut self, event: WatchEvent) -> Result<(), ControllerError> {
        let WatchEvent {
            event_type,
            object: mut resource,
        } = event;
        let name = resource.name().to_string();

        let actor_failed = self
            .clusters
            .get(&name)
            .is_some_and(|c| c.phase() == ClusterPhase::Failed);
        if resource.status.is_failed() || actor_failed {
            if event_type != WatchEventType::Deleted {
                return Err(ControllerError::FailedCluster(name));
            }
            if let Some(cluster) = self.clusters.get(&name) {
                self.delete_cluster(cluster).await;
                self.clusters.remove(&name);
            }
            info!(cluster = %name, "Removed failed cluster");
            return Ok(());
        }

        match event_type {
            WatchEventType::Added => {
                if self.clusters.contains_key(&name) {
                    return Err(ControllerError::already_created(&name));
                }
                self.admit(&mut resource)?;

                let cluster = ClusterHandle::spawn(resource, self.context.clone());
                info!(
                    cluster = %name,
                    namespace = %cluster.namespace(),
                    actor_id = %cluster.actor_id(),
                    "Created cluster actor"
                );
                self.clusters.insert(name, cluster);
                self.context.stats.cluster_created();
            }

            WatchEventType::Modified => {
                if !self.clusters.contains_key(&name) {
                    return Err(ControllerError::never_created(&name, event_type));
                }
                self.admit(&mut resource)?;

                if let Some(cluster) = self.clusters.get(&name) {
                    if let Err(e) = cluster.update(resource).await {
                        warn!(cluster = %name, error = %e, "Cluster actor is stopped, dropping update");
                    }
                }
                self.context.stats.cluster_modified();
            }

            WatchEventType::Deleted => {
                let Some(cluster) = self.clusters.get(&name) else {
                    return Err(ControllerError::never_created(&name, event_type));
                };
                // stays registered until teardown is done, so an interrupted
                // delete still gets stopped by `shutdown`
                self.delete_cluster(cluster).await;
                self.clusters.remove(&name);
            }
        }

        Ok(())
    }

    /// Apply defaults and validate a snapshot before it reaches an actor.
    fn admit(&self, resource: &mut ClusterResource) -> Result<(), ControllerError> {
        if resource.set_defaults(&self.context.settings.default_version) {
            debug!(
                cluster = %resource.name(),
                version = ?resource.spec.version,
                "Applied cluster defaults"
            );
        }

        resource
            .validate()
            .map(|_| ())
            .map_err(|source| ControllerError::Validation {
                name: resource.name().to_string(),
                source,
            })
    }

    async fn delete_cluster(&self, cluster: &ClusterHandle) {
        let report = cluster.delete().await;
        if report.is_clean() {
            info!(
                cluster = %cluster.name(),
                workloads_deleted = report.workloads_deleted,
                datastore_deleted = report.datastore_deleted,
                "Deleted cluster"
            );
        } else {
            warn!(
                cluster = %cluster.name(),
                errors = ?report.errors,
                "Deleted cluster with errors"
            );
        }
        self.context.stats.cluster_deleted();
    }

    /// Consume notifications until the stream ends or shutdown is signaled,
    /// then stop every actor.
    ///
    /// Shutdown also interrupts an event that is still being handled, such
    /// as an update waiting on a full actor queue.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Dispatcher entering main loop");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => {
                    info!("Dispatcher received shutdown signal");
                    break;
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Cluster event stream closed");
                        break;
                    };

                    let name = event.name().to_string();
                    let event_type = event.event_type;
                    let result = tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => None,
                        result = self.handle(event) => Some(result),
                    };
                    let Some(result) = result else {
                        warn!(cluster = %name, event = %event_type, "Shutdown interrupted cluster event");
                        break;
                    };

                    match result {
                        Ok(()) => debug!(cluster = %name, event = %event_type, "Handled cluster event"),
                        Err(e) if e.is_unsafe_state() => {
                            error!(cluster = %name, event = %event_type, error = %e, "Dropped cluster event");
                        }
                        Err(e) => {
                            warn!(cluster = %name, event = %event_type, error = %e, "Dropped cluster event");
                        }
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop every actor without tearing anything down.
    pub async fn shutdown(&mut self) {
        info!(count = self.clusters.len(), "Stopping all cluster actors");

        for cluster in self.clusters.values() {
            cluster.stop();
        }

        let deadline = Instant::now() + self.shutdown_grace;
        while Instant::now() < deadline {
            if self.clusters.values().all(|c| !c.is_running()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for (name, cluster) in &self.clusters {
            if cluster.is_running() {
                warn!(cluster = %name, "Force aborting cluster actor");
                cluster.abort();
            }
        }

        self.clusters.clear();
        info!(stats = ?self.context.stats.snapshot(), "Dispatcher stopped");
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clusters.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ClusterHandle> {
        self.clusters.get(name)
    }

    /// Number of registered actors.
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Registered cluster names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.keys().cloned().collect();
        names.sort();
        names
    }

    /// Phase published by a cluster's actor.
    pub fn phase_of(&self, name: &str) -> Option<ClusterPhase> {
        self.clusters.get(name).map(ClusterHandle::phase)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats.snapshot()
    }
}

// =============================================================================
// Tests
// =============================================================================

/// Resolves once shutdown is signaled or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
