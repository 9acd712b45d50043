//! Cluster actor - owns the full lifecycle of one cluster resource.
//!
//! ## State Machine
//!
//! ```text
//!   None ──create──▶ Creating ──ok──▶ Running ◀──┐
//!                       │                │       │ event / tick
//!                       │ error          └───────┘
//!                       ▼                │ update error
//!                     Failed ◀───────────┘
//! ```
//!
//! `Creating` observed at startup means a previous run stopped half way
//! through creation; the actor refuses to guess and goes to `Failed`.
//! `Failed` only accepts deletion.
//!
//! ## Message Flow
//!
//! - `ClusterEvent::Modified` → compare spec, adopt snapshot
//! - tick (no event for the reconcile interval) → persist status
//! - delete → teardown runs on the caller, then the stop signal ends the loop

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nestplane_api::{
    labels_for_cluster, ClusterPhase, ClusterResource, ClusterSpec, ClusterStatus,
    SemanticVersion,
};
use nestplane_id::ActorId;
use nestplane_reconcile::FixedRetry;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::framework::{spawn_actor, Actor, ActorContext, ActorError, ActorHandle};
use crate::context::ClusterContext;
use crate::error::{ClusterError, CreateStep};
use crate::objects::{ManagedObject, RouteSpec};
use crate::provision::{datastore_name, CredentialRequest, DatastoreSpec, EndpointSpec};
use crate::status::StatusPersister;
use crate::workload::{rewrite_workload, ControlPlaneConfig};

// =============================================================================
// Messages
// =============================================================================

/// Messages delivered to a cluster actor's queue.
#[derive(Debug)]
pub enum ClusterEvent {
    /// A new snapshot of the resource.
    Modified(ClusterResource),
}

// =============================================================================
// Cluster Actor
// =============================================================================

/// Actor driving one cluster resource.
pub struct ClusterActor {
    /// `namespace/name`, for logs.
    key: String,

    /// Last known copy of the resource.
    resource: ClusterResource,

    /// Status as observed by this actor; persisted when it differs from
    /// `resource.status`.
    status: ClusterStatus,

    persister: StatusPersister,

    context: Arc<ClusterContext>,

    /// Published phase, read by the dispatcher.
    phase: watch::Sender<ClusterPhase>,
}

impl ClusterActor {
    pub fn new(
        resource: ClusterResource,
        context: Arc<ClusterContext>,
    ) -> (Self, watch::Receiver<ClusterPhase>) {
        let status = resource.status.clone();
        let (phase, phase_rx) = watch::channel(status.phase);

        let actor = Self {
            key: resource.key(),
            persister: StatusPersister::new(context.store.clone()),
            resource,
            status,
            context,
            phase,
        };
        (actor, phase_rx)
    }

    fn cluster_name(&self) -> &str {
        self.resource.name()
    }

    fn namespace(&self) -> &str {
        self.resource.namespace()
    }

    fn set_phase(&mut self, phase: ClusterPhase) {
        self.status.set_phase(phase);
        self.phase.send_replace(phase);
    }

    fn mark_failed(&mut self, reason: String) {
        if self.status.phase != ClusterPhase::Failed {
            self.context.stats.cluster_failed();
        }
        self.status.set_reason(reason);
        self.set_phase(ClusterPhase::Failed);
    }

    async fn persist_status(&mut self) -> Result<bool, nestplane_reconcile::ReconcileError> {
        self.persister.persist(&mut self.resource, &self.status).await
    }

    // -------------------------------------------------------------------------
    // Setup
    // -------------------------------------------------------------------------

    async fn setup(&mut self) -> Result<(), ClusterError> {
        match self.status.phase {
            ClusterPhase::None => self.create().await,
            ClusterPhase::Running => {
                info!(cluster = %self.key, "Resuming running cluster");
                Ok(())
            }
            ClusterPhase::Creating => Err(ClusterError::CreatingOnStartup),
            phase => Err(ClusterError::UnexpectedPhase(phase)),
        }
    }

    /// Provision everything the cluster needs, in order, stopping at the
    /// first failure.
    async fn create(&mut self) -> Result<(), ClusterError> {
        let started = Instant::now();
        let context = self.context.clone();
        let settings = &context.settings;
        let name = self.cluster_name().to_string();
        let namespace = self.namespace().to_string();

        self.set_phase(ClusterPhase::Creating);
        if let Err(e) = self.persist_status().await {
            warn!(cluster = %self.key, error = %e, "Failed to record Creating phase");
        }

        // 1. Datastore
        let ds_name = datastore_name(&name);
        let datastore = context
            .datastores
            .create_or_adopt(
                &ds_name,
                &namespace,
                &labels_for_cluster(&ds_name),
                &DatastoreSpec::default(),
            )
            .await
            .map_err(ClusterError::at(CreateStep::Datastore))?;
        info!(cluster = %self.key, datastore = %datastore.name, "Waiting for datastore");
        let datastore = context
            .datastores
            .wait_ready(&datastore, &settings.poll)
            .await
            .map_err(|e| ClusterError::from_poll(CreateStep::Datastore, e))?;

        // 2. Network endpoint
        let endpoint = context
            .endpoints
            .ensure(&EndpointSpec::api_server(&name, &namespace))
            .await
            .map_err(ClusterError::at(CreateStep::Endpoint))?;
        let address = context
            .endpoints
            .wait_address_assigned(&endpoint, &settings.poll)
            .await
            .map_err(|e| ClusterError::from_poll(CreateStep::Endpoint, e))?;
        info!(cluster = %self.key, endpoint = %endpoint.name, %address, "Endpoint address assigned");

        // 3. Configuration
        let version = self
            .resolve_version()
            .map_err(ClusterError::at(CreateStep::Configuration))?;
        let hostname = self.resource.hostname(&settings.base_domain);
        let config = ControlPlaneConfig::new(datastore.client_url(), address, hostname.clone());

        // 4. Credentials
        let bundle = context
            .credentials
            .provision(&CredentialRequest {
                namespace: namespace.clone(),
                advertise_address: address,
                hostname: hostname.clone(),
                version: version.clone(),
            })
            .await
            .map_err(ClusterError::at(CreateStep::Credentials))?;
        debug!(cluster = %self.key, created = bundle.created, "Credential bundles ready");

        // 5. Workloads
        let rendered = context
            .renderer
            .render(&config, &version)
            .map_err(ClusterError::at(CreateStep::Workloads))?;
        for pod in rendered.into_vec() {
            let workload = rewrite_workload(&name, &namespace, pod, &bundle);
            debug!(cluster = %self.key, workload = %workload.name, "Applying workload");
            context
                .objects
                .apply(&ManagedObject::Workload(workload))
                .await
                .map_err(ClusterError::at(CreateStep::Workloads))?;
        }

        // 6. Route
        let route = RouteSpec::for_cluster(
            &name,
            &namespace,
            hostname,
            endpoint.name.clone(),
            &settings.ingress_class,
        );
        context
            .objects
            .apply(&ManagedObject::Route(route))
            .await
            .map_err(ClusterError::at(CreateStep::Route))?;

        info!(
            cluster = %self.key,
            %version,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cluster created"
        );
        Ok(())
    }

    fn resolve_version(&self) -> anyhow::Result<SemanticVersion> {
        let release = self.resource.validate()?;
        Ok(self.context.catalog.resolve(&release)?)
    }

    // -------------------------------------------------------------------------
    // Run loop handlers
    // -------------------------------------------------------------------------

    fn handle_update(&mut self, incoming: ClusterResource) -> Result<(), ClusterError> {
        if incoming.metadata.resource_version < self.resource.metadata.resource_version {
            debug!(
                cluster = %self.key,
                held = self.resource.metadata.resource_version,
                incoming = incoming.metadata.resource_version,
                "Ignoring stale snapshot"
            );
            return Ok(());
        }

        let previous = std::mem::replace(&mut self.resource, incoming);
        let old_spec = previous.spec;
        let new_spec = self.resource.spec.clone();

        if new_spec.semantically_equal(&old_spec) {
            if previous.metadata.labels != self.resource.metadata.labels
                || previous.metadata.uid != self.resource.metadata.uid
            {
                info!(cluster = %self.key, "Ignoring update event: only metadata changed");
            }
            return Ok(());
        }

        self.log_spec_update(&old_spec, &new_spec);

        if new_spec.version != old_spec.version {
            let version = self.resolve_version().map_err(ClusterError::Update)?;
            info!(
                cluster = %self.key,
                %version,
                "Recorded new version; running workloads are left as they are"
            );
        }
        Ok(())
    }

    fn log_spec_update(&self, old: &ClusterSpec, new: &ClusterSpec) {
        for (label, spec) in [("Old spec:", old), ("New spec:", new)] {
            info!(cluster = %self.key, "{}", label);
            match serde_json::to_string_pretty(spec) {
                Ok(json) => {
                    for line in json.lines() {
                        info!(cluster = %self.key, "{}", line);
                    }
                }
                Err(e) => error!(cluster = %self.key, error = %e, "Failed to encode cluster spec"),
            }
        }
    }

    async fn tick(&mut self) {
        let started = Instant::now();
        self.context.stats.reconcile_tick();

        if self.resource.spec.paused {
            self.status.pause_control();
            info!(cluster = %self.key, "Control is paused, skipping reconciliation");
            return;
        }
        self.status.control();

        match self.persist_status().await {
            Ok(written) => {
                debug!(
                    cluster = %self.key,
                    written,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Reconciled cluster"
                );
            }
            Err(e) => {
                self.context.stats.reconcile_failure();
                warn!(cluster = %self.key, error = %e, "Periodic status update failed");
                if e.is_conflict() {
                    self.refresh().await;
                }
            }
        }
    }

    /// Re-read the resource after a conflict, keeping the held spec.
    async fn refresh(&mut self) {
        let (namespace, name) = (self.namespace().to_string(), self.cluster_name().to_string());
        match self.persister.get_latest(&namespace, &name).await {
            Ok(latest) => {
                self.resource.metadata = latest.metadata;
                self.resource.status = latest.status;
            }
            Err(e) => warn!(cluster = %self.key, error = %e, "Failed to re-read cluster"),
        }
    }

    /// Record `Failed` on the resource, retrying at a fixed interval until
    /// the write lands, the resource is gone, or the actor is stopped.
    async fn report_failed_status(&mut self, ctx: &mut ActorContext) {
        let interval = self.context.settings.status_retry_interval;
        let mut retry = FixedRetry::new(interval);
        let (namespace, name) = (self.namespace().to_string(), self.cluster_name().to_string());

        loop {
            let attempt = tokio::select! {
                biased;
                _ = ctx.stop.stopped() => {
                    info!(cluster = %self.key, "Stopped while reporting failure");
                    return;
                }
                attempt = retry.next_attempt() => attempt,
            };

            self.set_phase(ClusterPhase::Failed);
            let err = match self.persist_status().await {
                Ok(_) => {
                    info!(cluster = %self.key, attempt, "Recorded cluster failure");
                    return;
                }
                Err(e) if e.is_not_found() => {
                    info!(cluster = %self.key, "Cluster resource is gone, not recording failure");
                    return;
                }
                Err(e) => e,
            };

            if !err.is_conflict() {
                warn!(cluster = %self.key, error = %err, retry_in = ?interval, "Failed to record cluster failure");
                continue;
            }

            match self.persister.get_latest(&namespace, &name).await {
                Ok(latest) => self.resource = latest,
                Err(e) if e.is_not_found() => {
                    info!(cluster = %self.key, "Cluster resource is gone, not recording failure");
                    return;
                }
                Err(e) => {
                    warn!(cluster = %self.key, error = %e, retry_in = ?interval, "Failed to get latest cluster version");
                }
            }
        }
    }
}

#[async_trait]
impl Actor for ClusterActor {
    type Message = ClusterEvent;

    fn name(&self) -> &str {
        "cluster"
    }

    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        if let Err(err) = self.setup().await {
            error!(cluster = %self.key, error = %err, "Cluster failed to set up");
            if self.status.phase != ClusterPhase::Failed {
                self.mark_failed(err.to_string());
                if let Err(e) = self.persist_status().await {
                    error!(cluster = %self.key, error = %e, "Failed to record cluster failure");
                }
            }
            return Err(ActorError::Permanent(err.to_string()));
        }

        self.set_phase(ClusterPhase::Running);
        if let Err(e) = self.persist_status().await {
            warn!(cluster = %self.key, error = %e, "Failed to record Running phase");
        }
        info!(cluster = %self.key, "Cluster running");
        Ok(())
    }

    async fn handle(&mut self, msg: ClusterEvent, ctx: &mut ActorContext) -> Result<bool, ActorError> {
        match msg {
            ClusterEvent::Modified(resource) => {
                if let Err(err) = self.handle_update(resource) {
                    error!(cluster = %self.key, error = %err, "Handle update event failed");
                    self.mark_failed(err.to_string());
                    self.report_failed_status(ctx).await;
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.context.settings.reconcile_interval)
    }

    async fn on_tick(&mut self, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        self.tick().await;
        Ok(true)
    }
}

// =============================================================================
// Teardown
// =============================================================================

/// What teardown managed to delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub workloads_deleted: usize,
    pub datastore_deleted: bool,
    /// Failures that were logged and skipped.
    pub errors: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Delete a cluster's workloads and datastore, continuing past failures.
pub async fn teardown(context: &ClusterContext, name: &str, namespace: &str) -> TeardownReport {
    let mut report = TeardownReport::default();
    let selector = labels_for_cluster(name);

    match context.objects.list_workloads(namespace, &selector).await {
        Ok(workloads) => {
            info!(cluster = %name, namespace = %namespace, count = workloads.len(), "Deleting workloads");
            for workload in workloads {
                match context.objects.delete_workload(namespace, &workload.name).await {
                    Ok(()) => report.workloads_deleted += 1,
                    Err(e) => {
                        warn!(cluster = %name, workload = %workload.name, error = %e, "Failed to delete workload");
                        report.errors.push(format!("workload {}: {:#}", workload.name, e));
                    }
                }
            }
        }
        Err(e) => {
            warn!(cluster = %name, error = %e, "Failed to list workloads");
            report.errors.push(format!("list workloads: {:#}", e));
        }
    }

    let ds_name = datastore_name(name);
    match context.datastores.get(namespace, &ds_name).await {
        Ok(Some(datastore)) => match context.datastores.delete(&datastore).await {
            Ok(()) => {
                info!(cluster = %name, datastore = %ds_name, "Deleted datastore");
                report.datastore_deleted = true;
            }
            Err(e) => {
                warn!(cluster = %name, datastore = %ds_name, error = %e, "Failed to delete datastore");
                report.errors.push(format!("datastore {}: {:#}", ds_name, e));
            }
        },
        Ok(None) => debug!(cluster = %name, datastore = %ds_name, "Datastore not found"),
        Err(e) => {
            warn!(cluster = %name, datastore = %ds_name, error = %e, "Failed to look up datastore");
            report.errors.push(format!("datastore {}: {:#}", ds_name, e));
        }
    }

    report
}

// =============================================================================
// Handle
// =============================================================================

/// The two ways in: enqueue an update, or delete.
pub struct ClusterHandle {
    name: String,
    namespace: String,
    actor: ActorHandle<ClusterEvent>,
    phase: watch::Receiver<ClusterPhase>,
    context: Arc<ClusterContext>,
}

impl ClusterHandle {
    /// Spawn an actor for `resource`. Setup starts immediately in the
    /// background.
    pub fn spawn(resource: ClusterResource, context: Arc<ClusterContext>) -> Self {
        let name = resource.name().to_string();
        let namespace = resource.namespace().to_string();
        let capacity = context.settings.event_queue_capacity;

        let (actor, phase) = ClusterActor::new(resource, context.clone());
        let actor = spawn_actor(actor, capacity);

        Self {
            name,
            namespace,
            actor,
            phase,
            context,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn actor_id(&self) -> ActorId {
        *self.actor.actor_id()
    }

    /// Current phase as published by the actor.
    pub fn phase(&self) -> ClusterPhase {
        *self.phase.borrow()
    }

    /// Wait until the published phase satisfies `done`, or `timeout` passes.
    pub async fn wait_for_phase<F>(&self, done: F, timeout: Duration) -> Option<ClusterPhase>
    where
        F: Fn(ClusterPhase) -> bool,
    {
        let mut rx = self.phase.clone();
        let reached = match tokio::time::timeout(timeout, rx.wait_for(|p| done(*p))).await {
            Ok(Ok(phase)) => Some(*phase),
            _ => None,
        };
        reached.or_else(|| {
            let phase = *self.phase.borrow();
            done(phase).then_some(phase)
        })
    }

    /// Queue a new snapshot. Waits while the queue is full; fails once the
    /// actor is stopped.
    pub async fn update(&self, resource: ClusterResource) -> Result<(), ActorError> {
        self.actor.mailbox.send(ClusterEvent::Modified(resource)).await
    }

    /// Events waiting in the actor's queue.
    pub fn queued(&self) -> usize {
        self.actor.mailbox.len()
    }

    /// Tear down the cluster's objects, then stop the actor.
    pub async fn delete(&self) -> TeardownReport {
        info!(cluster = %self.name, namespace = %self.namespace, "Cluster is deleted by user");
        let report = teardown(&self.context, &self.name, &self.namespace).await;
        self.stop();
        report
    }

    /// Signal stop. Returns false if the actor was already stopped.
    pub fn stop(&self) -> bool {
        self.actor.stop.stop()
    }

    pub fn is_running(&self) -> bool {
        self.actor.is_running()
    }

    pub fn abort(&self) {
        self.actor.abort();
    }

    pub async fn join(&mut self) {
        self.actor.join().await;
    }
}

// =============================================================================
// Tests
// =============================================================================
