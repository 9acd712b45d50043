//! In-memory collaborators.
//!
//! Thread-safe stand-ins for the cluster store and every provisioner. They
//! keep call counters and support fault injection so the controller can be
//! exercised end to end without a real API server. The binary wires them
//! in until real adapters exist.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use nestplane_api::{selector_matches, ClusterResource, Labels, ReleaseCatalog};
use nestplane_reconcile::ReconcileError;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::context::{ActorSettings, ClusterContext};
use crate::objects::{ManagedObject, ObjectApplier, RouteSpec};
use crate::provision::{
    CredentialBundleSet, CredentialProvisioner, CredentialRequest, DatastoreHandle,
    DatastorePhase, DatastoreProvisioner, DatastoreSpec, EndpointProvisioner, EndpointRef,
    EndpointSpec, DATASTORE_CLIENT_PORT,
};
use crate::stats::ControllerStats;
use crate::store::ClusterStore;
use crate::workload::{DefaultRenderer, WorkloadSpec};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Consume one unit of an injected fault counter.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// =============================================================================
// Cluster store
// =============================================================================

/// Cluster resources with resource-version checks on update.
#[derive(Default)]
pub struct MemoryClusterStore {
    resources: Mutex<HashMap<Key, ClusterResource>>,
    version: AtomicU64,
    injected_conflicts: AtomicU32,
    update_calls: AtomicU32,
    get_calls: AtomicU32,
}

impl MemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Store a resource as if a user created it, returning the stored copy.
    pub async fn insert(&self, mut resource: ClusterResource) -> ClusterResource {
        resource.metadata.resource_version = self.next_version();
        let mut resources = self.resources.lock().await;
        resources.insert(
            key(resource.namespace(), resource.name()),
            resource.clone(),
        );
        resource
    }

    /// Store a user's copy of a resource, keeping the stored status if the
    /// resource already exists.
    pub async fn upsert(&self, mut resource: ClusterResource) -> ClusterResource {
        let mut resources = self.resources.lock().await;
        let k = key(resource.namespace(), resource.name());
        if let Some(existing) = resources.get(&k) {
            resource.status = existing.status.clone();
            resource.metadata.uid = existing.metadata.uid;
        }
        resource.metadata.resource_version = self.next_version();
        resources.insert(k, resource.clone());
        resource
    }

    /// Change a stored resource out of band, bumping its version.
    pub async fn modify<F>(
        &self,
        namespace: &str,
        name: &str,
        f: F,
    ) -> Result<ClusterResource, ReconcileError>
    where
        F: FnOnce(&mut ClusterResource),
    {
        let mut resources = self.resources.lock().await;
        let stored = resources
            .get_mut(&key(namespace, name))
            .ok_or_else(|| ReconcileError::NotFound(format!("{namespace}/{name}")))?;
        f(stored);
        stored.metadata.resource_version = self.next_version();
        Ok(stored.clone())
    }

    pub async fn remove(&self, namespace: &str, name: &str) -> Option<ClusterResource> {
        self.resources.lock().await.remove(&key(namespace, name))
    }

    /// Fail the next `n` updates with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn update_calls(&self) -> u32 {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> u32 {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<ClusterResource, ReconcileError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.resources
            .lock()
            .await
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ReconcileError::NotFound(format!("{namespace}/{name}")))
    }

    async fn update(&self, resource: &ClusterResource) -> Result<ClusterResource, ReconcileError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let cluster = resource.key();

        if take_one(&self.injected_conflicts) {
            return Err(ReconcileError::Conflict(format!(
                "{cluster}: injected conflict"
            )));
        }

        let mut resources = self.resources.lock().await;
        let stored = resources
            .get_mut(&key(resource.namespace(), resource.name()))
            .ok_or_else(|| ReconcileError::NotFound(cluster.clone()))?;

        if stored.metadata.resource_version != resource.metadata.resource_version {
            return Err(ReconcileError::Conflict(format!(
                "{cluster}: stored version {} but update is based on {}",
                stored.metadata.resource_version, resource.metadata.resource_version
            )));
        }

        *stored = resource.clone();
        stored.metadata.resource_version = self.next_version();
        Ok(stored.clone())
    }
}

// =============================================================================
// Datastores
// =============================================================================

/// Datastores that become ready after a configurable number of polls.
#[derive(Default)]
pub struct MemoryDatastores {
    datastores: Mutex<HashMap<Key, DatastoreHandle>>,
    pending_polls: Mutex<HashMap<Key, u32>>,
    not_ready_polls: AtomicU32,
    never_ready: AtomicBool,
    fail_deletes: AtomicBool,
    create_calls: AtomicU32,
    get_calls: AtomicU32,
    delete_calls: AtomicU32,
}

impl MemoryDatastores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report not-ready for the first `n` lookups of each new datastore.
    pub fn set_not_ready_polls(&self, n: u32) {
        self.not_ready_polls.store(n, Ordering::SeqCst);
    }

    /// Never report ready.
    pub fn set_never_ready(&self, never: bool) {
        self.never_ready.store(never, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Drop a datastore without going through `delete`.
    pub async fn forget(&self, namespace: &str, name: &str) {
        self.datastores.lock().await.remove(&key(namespace, name));
    }

    pub async fn contains(&self, namespace: &str, name: &str) -> bool {
        self.datastores
            .lock()
            .await
            .contains_key(&key(namespace, name))
    }

    pub async fn len(&self) -> usize {
        self.datastores.lock().await.len()
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> u32 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatastoreProvisioner for MemoryDatastores {
    async fn create_or_adopt(
        &self,
        name: &str,
        namespace: &str,
        labels: &Labels,
        spec: &DatastoreSpec,
    ) -> Result<DatastoreHandle> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let k = key(namespace, name);

        let mut datastores = self.datastores.lock().await;
        if let Some(existing) = datastores.get_mut(&k) {
            if existing.spec != *spec {
                info!(datastore = %name, namespace = %namespace, "Adopted datastore, updating spec");
                existing.spec = spec.clone();
            } else {
                debug!(datastore = %name, namespace = %namespace, "Adopted datastore");
            }
            return Ok(existing.clone());
        }

        let handle = DatastoreHandle {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: labels.clone(),
            spec: spec.clone(),
            phase: DatastorePhase::Creating,
            service_name: format!("{name}-client"),
            client_port: DATASTORE_CLIENT_PORT,
        };
        datastores.insert(k.clone(), handle.clone());
        self.pending_polls
            .lock()
            .await
            .insert(k, self.not_ready_polls.load(Ordering::SeqCst));

        info!(datastore = %name, namespace = %namespace, size = spec.size, "[MEMORY] Created datastore");
        Ok(handle)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DatastoreHandle>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let k = key(namespace, name);

        let mut datastores = self.datastores.lock().await;
        let Some(handle) = datastores.get_mut(&k) else {
            return Ok(None);
        };

        if handle.phase != DatastorePhase::Running && !self.never_ready.load(Ordering::SeqCst) {
            let mut pending = self.pending_polls.lock().await;
            let remaining = pending.entry(k).or_insert(0);
            if *remaining == 0 {
                handle.phase = DatastorePhase::Running;
            } else {
                *remaining -= 1;
            }
        }

        Ok(Some(handle.clone()))
    }

    async fn delete(&self, handle: &DatastoreHandle) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            bail!("datastore api unavailable");
        }

        let k = key(&handle.namespace, &handle.name);
        self.datastores.lock().await.remove(&k);
        self.pending_polls.lock().await.remove(&k);
        Ok(())
    }
}

// =============================================================================
// Endpoints
// =============================================================================

/// Endpoints that get an address from `10.96.0.0/24` after a number of polls.
pub struct MemoryEndpoints {
    endpoints: Mutex<HashMap<Key, (EndpointSpec, EndpointRef)>>,
    pending_polls: Mutex<HashMap<Key, u32>>,
    unassigned_polls: AtomicU32,
    next_host: AtomicU32,
    ensure_calls: AtomicU32,
}

impl Default for MemoryEndpoints {
    fn default() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            pending_polls: Mutex::new(HashMap::new()),
            unassigned_polls: AtomicU32::new(0),
            next_host: AtomicU32::new(10),
            ensure_calls: AtomicU32::new(0),
        }
    }
}

impl MemoryEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave new endpoints without an address for the first `n` lookups.
    pub fn set_unassigned_polls(&self, n: u32) {
        self.unassigned_polls.store(n, Ordering::SeqCst);
    }

    pub async fn spec(&self, namespace: &str, name: &str) -> Option<EndpointSpec> {
        self.endpoints
            .lock()
            .await
            .get(&key(namespace, name))
            .map(|(spec, _)| spec.clone())
    }

    pub fn ensure_calls(&self) -> u32 {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    fn allocate(&self) -> IpAddr {
        let host = self.next_host.fetch_add(1, Ordering::SeqCst);
        IpAddr::V4(Ipv4Addr::new(10, 96, 0, (host % 250) as u8))
    }
}

#[async_trait]
impl EndpointProvisioner for MemoryEndpoints {
    async fn ensure(&self, spec: &EndpointSpec) -> Result<EndpointRef> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        let k = key(&spec.namespace, &spec.name);

        let mut endpoints = self.endpoints.lock().await;
        if let Some((_, existing)) = endpoints.get(&k) {
            return Ok(existing.clone());
        }

        let endpoint = EndpointRef {
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            address: None,
        };
        endpoints.insert(k.clone(), (spec.clone(), endpoint.clone()));
        self.pending_polls
            .lock()
            .await
            .insert(k, self.unassigned_polls.load(Ordering::SeqCst));

        info!(endpoint = %spec.name, namespace = %spec.namespace, "[MEMORY] Created endpoint");
        Ok(endpoint)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<EndpointRef>> {
        let k = key(namespace, name);

        let mut endpoints = self.endpoints.lock().await;
        let Some((_, endpoint)) = endpoints.get_mut(&k) else {
            return Ok(None);
        };

        if endpoint.address.is_none() {
            let mut pending = self.pending_polls.lock().await;
            let remaining = pending.entry(k).or_insert(0);
            if *remaining == 0 {
                endpoint.address = Some(self.allocate());
            } else {
                *remaining -= 1;
            }
        }

        Ok(Some(endpoint.clone()))
    }
}

// =============================================================================
// Credentials
// =============================================================================

const CERTIFICATE_FILES: [&str; 8] = [
    "ca.crt",
    "ca.key",
    "apiserver.crt",
    "apiserver.key",
    "sa.key",
    "sa.pub",
    "front-proxy-ca.crt",
    "front-proxy-ca.key",
];

const KUBECONFIG_FILES: [&str; 3] = ["admin.conf", "controller-manager.conf", "scheduler.conf"];

/// One credential bundle set per namespace, generated once.
#[derive(Default)]
pub struct MemoryCredentials {
    bundles: Mutex<HashMap<String, CredentialBundleSet>>,
    requests: Mutex<Vec<CredentialRequest>>,
    provision_calls: AtomicU32,
    generated: AtomicU32,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provision_calls(&self) -> u32 {
        self.provision_calls.load(Ordering::SeqCst)
    }

    /// Number of bundle sets actually generated.
    pub fn generated(&self) -> u32 {
        self.generated.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<CredentialRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl CredentialProvisioner for MemoryCredentials {
    async fn provision(&self, request: &CredentialRequest) -> Result<CredentialBundleSet> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());

        let mut bundles = self.bundles.lock().await;
        if let Some(existing) = bundles.get(&request.namespace) {
            debug!(namespace = %request.namespace, "Reusing credential bundles");
            return Ok(CredentialBundleSet {
                created: false,
                ..existing.clone()
            });
        }

        let certificates = format!("{}-k8s-certs", request.namespace);
        let kubeconfig = format!("{}-kubeconfig", request.namespace);
        let entries: BTreeMap<String, Vec<String>> = [
            (
                certificates.clone(),
                CERTIFICATE_FILES.iter().map(|f| f.to_string()).collect(),
            ),
            (
                kubeconfig.clone(),
                KUBECONFIG_FILES.iter().map(|f| f.to_string()).collect(),
            ),
        ]
        .into();

        let bundle = CredentialBundleSet {
            certificates,
            kubeconfig,
            entries,
            created: true,
        };
        bundles.insert(request.namespace.clone(), bundle.clone());
        self.generated.fetch_add(1, Ordering::SeqCst);

        info!(
            namespace = %request.namespace,
            hostname = %request.hostname,
            advertise_address = %request.advertise_address,
            "[MEMORY] Generated credential bundles"
        );
        Ok(bundle)
    }
}

// =============================================================================
// Objects
// =============================================================================

/// Workloads and routes keyed by namespace and name.
#[derive(Default)]
pub struct MemoryObjects {
    workloads: Mutex<BTreeMap<Key, WorkloadSpec>>,
    routes: Mutex<BTreeMap<Key, RouteSpec>>,
    fail_applies: AtomicBool,
    fail_deletes: AtomicBool,
    apply_calls: AtomicU32,
    delete_calls: AtomicU32,
}

impl MemoryObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_applies(&self, fail: bool) {
        self.fail_applies.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub async fn workloads(&self, namespace: &str) -> Vec<WorkloadSpec> {
        self.workloads
            .lock()
            .await
            .values()
            .filter(|w| w.namespace == namespace)
            .cloned()
            .collect()
    }

    pub async fn route(&self, namespace: &str, name: &str) -> Option<RouteSpec> {
        self.routes.lock().await.get(&key(namespace, name)).cloned()
    }

    pub fn apply_calls(&self) -> u32 {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectApplier for MemoryObjects {
    async fn apply(&self, object: &ManagedObject) -> Result<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_applies.load(Ordering::SeqCst) {
            bail!("object api rejected {} {}", object.kind(), object.name());
        }

        let k = key(object.namespace(), object.name());
        let replaced = match object {
            ManagedObject::Workload(w) => self.workloads.lock().await.insert(k, w.clone()).is_some(),
            ManagedObject::Route(r) => self.routes.lock().await.insert(k, r.clone()).is_some(),
        };

        debug!(
            kind = object.kind(),
            name = %object.name(),
            namespace = %object.namespace(),
            replaced,
            "[MEMORY] Applied object"
        );
        Ok(())
    }

    async fn list_workloads(&self, namespace: &str, selector: &Labels) -> Result<Vec<WorkloadSpec>> {
        Ok(self
            .workloads
            .lock()
            .await
            .values()
            .filter(|w| w.namespace == namespace && selector_matches(selector, &w.labels))
            .cloned()
            .collect())
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            bail!("object api unavailable while deleting {namespace}/{name}");
        }
        self.workloads.lock().await.remove(&key(namespace, name));
        Ok(())
    }
}

// =============================================================================
// Backend bundle
// =============================================================================

/// All in-memory collaborators, kept as concrete types so callers can
/// inspect counters and inject faults.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub store: Arc<MemoryClusterStore>,
    pub datastores: Arc<MemoryDatastores>,
    pub endpoints: Arc<MemoryEndpoints>,
    pub credentials: Arc<MemoryCredentials>,
    pub objects: Arc<MemoryObjects>,
    pub stats: Arc<ControllerStats>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an actor context backed by these collaborators.
    pub fn context(&self, settings: ActorSettings, catalog: ReleaseCatalog) -> Arc<ClusterContext> {
        Arc::new(ClusterContext {
            store: self.store.clone(),
            datastores: self.datastores.clone(),
            endpoints: self.endpoints.clone(),
            credentials: self.credentials.clone(),
            renderer: Arc::new(DefaultRenderer),
            objects: self.objects.clone(),
            catalog,
            settings,
            stats: self.stats.clone(),
        })
    }

    /// Calls that create or change external objects.
    pub fn provisioning_calls(&self) -> u32 {
        self.datastores.create_calls()
            + self.endpoints.ensure_calls()
            + self.credentials.provision_calls()
            + self.objects.apply_calls()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_injected_conflicts_are_consumed() {
        let store = MemoryClusterStore::new();
        let stored = store.insert(ClusterResource::new("db1", "team-a")).await;
        store.inject_conflicts(2);

        assert!(store.update(&stored).await.unwrap_err().is_conflict());
        assert!(store.update(&stored).await.unwrap_err().is_conflict());
        let updated = store.update(&stored).await.unwrap();
        assert!(updated.metadata.resource_version > stored.metadata.resource_version);
        assert_eq!(store.update_calls(), 3);
    }

    #[tokio::test]
    async fn test_upsert_keeps_stored_status() {
        let store = MemoryClusterStore::new();
        let mut first = ClusterResource::new("db1", "team-a");
        first.status.set_phase(nestplane_api::ClusterPhase::Running);
        let first = store.insert(first).await;

        let again = store
            .upsert(ClusterResource::new("db1", "team-a").with_version("v1.9.11"))
            .await;

        assert_eq!(again.status.phase, nestplane_api::ClusterPhase::Running);
        assert_eq!(again.metadata.uid, first.metadata.uid);
        assert!(again.metadata.resource_version > first.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_datastore_ready_after_polls() {
        let datastores = MemoryDatastores::new();
        datastores.set_not_ready_polls(2);
        datastores
            .create_or_adopt("db1-etcd", "team-a", &Labels::new(), &DatastoreSpec::default())
            .await
            .unwrap();

        let phases: Vec<bool> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(datastores.get("team-a", "db1-etcd").await.unwrap().unwrap().is_ready());
            }
            out
        };
        assert_eq!(phases, vec![false, false, true]);
    }

    #[tokio::test]
    async fn test_datastore_adoption_reconciles_spec() {
        let datastores = MemoryDatastores::new();
        datastores
            .create_or_adopt("db1-etcd", "team-a", &Labels::new(), &DatastoreSpec { size: 3 })
            .await
            .unwrap();
        let adopted = datastores
            .create_or_adopt("db1-etcd", "team-a", &Labels::new(), &DatastoreSpec::default())
            .await
            .unwrap();

        assert_eq!(adopted.spec.size, 1);
        assert_eq!(datastores.len().await, 1);
    }

    #[tokio::test]
    async fn test_credentials_reused_per_namespace() {
        let credentials = MemoryCredentials::new();
        let request = CredentialRequest {
            namespace: "team-a".into(),
            advertise_address: IpAddr::V4(Ipv4Addr::new(10, 96, 0, 10)),
            hostname: "db1.team-a.example.com".into(),
            version: nestplane_api::SemanticVersion::new(1, 9, 11),
        };

        let first = credentials.provision(&request).await.unwrap();
        let second = credentials.provision(&request).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.certificates, second.certificates);
        assert_eq!(credentials.generated(), 1);
        assert_eq!(credentials.provision_calls(), 2);
    }

    #[tokio::test]
    async fn test_endpoint_address_assigned_after_polls() {
        let endpoints = MemoryEndpoints::new();
        endpoints.set_unassigned_polls(1);
        let spec = EndpointSpec::api_server("db1", "team-a");
        endpoints.ensure(&spec).await.unwrap();

        let first = endpoints.get("team-a", &spec.name).await.unwrap().unwrap();
        let second = endpoints.get("team-a", &spec.name).await.unwrap().unwrap();
        assert!(first.address.is_none());
        assert!(second.address.is_some());
        // ensure is idempotent
        assert_eq!(endpoints.ensure(&spec).await.unwrap(), second);
    }
}
