//! Provisioners for the external pieces a cluster depends on.
//!
//! Each collaborator is an async trait so the actor can be driven against
//! real APIs or the in-memory implementations in [`crate::memory`]:
//! - `DatastoreProvisioner`: the backing etcd-style datastore cluster
//! - `EndpointProvisioner`: the stable network endpoint of the API server
//! - `CredentialProvisioner`: PKI material and kubeconfig bundles

use std::collections::BTreeMap;
use std::net::IpAddr;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use nestplane_api::{labels_for_cluster, Labels, SemanticVersion, COMPONENT_LABEL};
use nestplane_reconcile::{poll_until, PollError, PollPolicy};
use serde::{Deserialize, Serialize};

/// Number of datastore members created for each cluster.
pub const DATASTORE_SIZE: u32 = 1;

/// Client port the datastore service listens on.
pub const DATASTORE_CLIENT_PORT: u16 = 2379;

/// Port the API server endpoint exposes.
pub const API_SERVER_PORT: u16 = 443;

/// Component label value of the API server.
pub const API_SERVER_COMPONENT: &str = "kube-apiserver";

// =============================================================================
// Datastore
// =============================================================================

/// Name of a cluster's datastore.
pub fn datastore_name(cluster: &str) -> String {
    format!("{}-etcd", cluster)
}

/// Desired shape of a datastore cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreSpec {
    pub size: u32,
}

impl Default for DatastoreSpec {
    fn default() -> Self {
        Self {
            size: DATASTORE_SIZE,
        }
    }
}

/// Observed datastore lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatastorePhase {
    Pending,
    Creating,
    Running,
    Failed,
}

/// A datastore cluster as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreHandle {
    pub name: String,
    pub namespace: String,
    pub labels: Labels,
    pub spec: DatastoreSpec,
    pub phase: DatastorePhase,
    pub service_name: String,
    pub client_port: u16,
}

impl DatastoreHandle {
    pub fn is_ready(&self) -> bool {
        self.phase == DatastorePhase::Running
    }

    /// Client URL handed to the API server.
    pub fn client_url(&self) -> String {
        format!("http://{}:{}", self.service_name, self.client_port)
    }
}

/// Provisioner for the backing datastore cluster.
#[async_trait]
pub trait DatastoreProvisioner: Send + Sync {
    /// Create the datastore, or adopt an existing one and bring its spec
    /// in line with `spec`.
    async fn create_or_adopt(
        &self,
        name: &str,
        namespace: &str,
        labels: &Labels,
        spec: &DatastoreSpec,
    ) -> Result<DatastoreHandle>;

    /// Look up a datastore. `Ok(None)` means it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DatastoreHandle>>;

    /// Delete a datastore. Deleting an absent datastore is not an error.
    async fn delete(&self, handle: &DatastoreHandle) -> Result<()>;

    /// Wait until the datastore reports it is running.
    async fn wait_ready(
        &self,
        handle: &DatastoreHandle,
        policy: &PollPolicy,
    ) -> Result<DatastoreHandle, PollError<anyhow::Error>> {
        let resource = format!("datastore {}/{}", handle.namespace, handle.name);
        poll_until(&resource, policy, || async move {
            match self.get(&handle.namespace, &handle.name).await? {
                Some(current) if current.is_ready() => Ok(Some(current)),
                Some(current) if current.phase == DatastorePhase::Failed => {
                    Err(anyhow!("datastore {} failed", current.name))
                }
                Some(_) => Ok(None),
                None => Err(anyhow!("datastore {} disappeared", handle.name)),
            }
        })
        .await
    }
}

// =============================================================================
// Network endpoint
// =============================================================================

/// Name of a cluster's API server endpoint.
pub fn endpoint_name(cluster: &str) -> String {
    format!("{}-{}", cluster, API_SERVER_COMPONENT)
}

/// A port exposed by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    pub name: String,
    pub port: u16,
    pub target_port: u16,
    pub protocol: String,
}

/// Desired network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    pub namespace: String,
    pub labels: Labels,
    pub selector: Labels,
    pub ports: Vec<EndpointPort>,
}

impl EndpointSpec {
    /// The API server endpoint for a cluster.
    pub fn api_server(cluster: &str, namespace: &str) -> Self {
        let mut labels = labels_for_cluster(cluster);
        labels.insert(COMPONENT_LABEL.to_string(), API_SERVER_COMPONENT.to_string());

        Self {
            name: endpoint_name(cluster),
            namespace: namespace.to_string(),
            selector: labels.clone(),
            labels,
            ports: vec![EndpointPort {
                name: "https".to_string(),
                port: API_SERVER_PORT,
                target_port: API_SERVER_PORT,
                protocol: "TCP".to_string(),
            }],
        }
    }
}

/// An endpoint as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRef {
    pub name: String,
    pub namespace: String,
    /// Internal address; `None` until one is allocated.
    pub address: Option<IpAddr>,
}

/// Provisioner for the control plane's network endpoint.
#[async_trait]
pub trait EndpointProvisioner: Send + Sync {
    /// Create the endpoint if it does not exist yet.
    async fn ensure(&self, spec: &EndpointSpec) -> Result<EndpointRef>;

    /// Look up an endpoint. `Ok(None)` means it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<EndpointRef>>;

    /// Wait until the endpoint has an address.
    async fn wait_address_assigned(
        &self,
        endpoint: &EndpointRef,
        policy: &PollPolicy,
    ) -> Result<IpAddr, PollError<anyhow::Error>> {
        let resource = format!("endpoint {}/{}", endpoint.namespace, endpoint.name);
        poll_until(&resource, policy, || async move {
            match self.get(&endpoint.namespace, &endpoint.name).await? {
                Some(current) => Ok(current.address),
                None => Err(anyhow!("endpoint {} disappeared", endpoint.name)),
            }
        })
        .await
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Inputs for PKI material and credential bundles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRequest {
    pub namespace: String,
    pub advertise_address: IpAddr,
    pub hostname: String,
    pub version: SemanticVersion,
}

/// Where the provisioned bundles can be mounted from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundleSet {
    /// Secret holding certificates and keys.
    pub certificates: String,

    /// Secret holding kubeconfig files.
    pub kubeconfig: String,

    /// Files in each bundle, by secret name.
    pub entries: BTreeMap<String, Vec<String>>,

    /// False when an existing bundle was reused.
    pub created: bool,
}

/// Provisioner for certificates and kubeconfig bundles.
///
/// Calls are idempotent: a bundle that already exists for the namespace is
/// returned as is, never regenerated.
#[async_trait]
pub trait CredentialProvisioner: Send + Sync {
    async fn provision(&self, request: &CredentialRequest) -> Result<CredentialBundleSet>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_server_endpoint_shape() {
        let spec = EndpointSpec::api_server("db1", "team-a");
        assert_eq!(spec.name, "db1-kube-apiserver");
        assert_eq!(spec.selector.get("component").unwrap(), "kube-apiserver");
        assert_eq!(spec.selector.get("nestplane_cluster").unwrap(), "db1");
        assert_eq!(spec.ports.len(), 1);
        assert_eq!(spec.ports[0].name, "https");
        assert_eq!(spec.ports[0].port, 443);
    }

    #[test]
    fn test_datastore_naming() {
        assert_eq!(datastore_name("db1"), "db1-etcd");
        let handle = DatastoreHandle {
            name: datastore_name("db1"),
            namespace: "team-a".into(),
            labels: labels_for_cluster("db1-etcd"),
            spec: DatastoreSpec::default(),
            phase: DatastorePhase::Creating,
            service_name: "db1-etcd-client".into(),
            client_port: DATASTORE_CLIENT_PORT,
        };
        assert!(!handle.is_ready());
        assert_eq!(handle.client_url(), "http://db1-etcd-client:2379");
    }
}
