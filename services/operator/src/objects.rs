//! Create-or-update of the workload and route objects a cluster owns.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use nestplane_api::Labels;
use serde::{Deserialize, Serialize};

use crate::provision::API_SERVER_PORT;
use crate::workload::WorkloadSpec;

/// Annotation selecting the ingress controller that serves a route.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Name of a cluster's route.
pub fn route_name(cluster: &str) -> String {
    format!("ingress-{}", cluster)
}

/// Binds a public hostname to the API server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub name: String,
    pub namespace: String,
    pub host: String,
    pub service_name: String,
    pub service_port: u16,
    pub annotations: BTreeMap<String, String>,
}

impl RouteSpec {
    pub fn for_cluster(
        cluster: &str,
        namespace: &str,
        host: String,
        service_name: String,
        ingress_class: &str,
    ) -> Self {
        Self {
            name: route_name(cluster),
            namespace: namespace.to_string(),
            host,
            service_name,
            service_port: API_SERVER_PORT,
            annotations: [(
                INGRESS_CLASS_ANNOTATION.to_string(),
                ingress_class.to_string(),
            )]
            .into(),
        }
    }
}

/// An object applied with upsert semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ManagedObject {
    Workload(WorkloadSpec),
    Route(RouteSpec),
}

impl ManagedObject {
    pub fn name(&self) -> &str {
        match self {
            ManagedObject::Workload(w) => &w.name,
            ManagedObject::Route(r) => &r.name,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            ManagedObject::Workload(w) => &w.namespace,
            ManagedObject::Route(r) => &r.namespace,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ManagedObject::Workload(_) => "workload",
            ManagedObject::Route(_) => "route",
        }
    }
}

/// Idempotent create-or-update, plus the lookups teardown needs.
#[async_trait]
pub trait ObjectApplier: Send + Sync {
    /// Create the object, or replace it if it already exists.
    async fn apply(&self, object: &ManagedObject) -> Result<()>;

    /// Workloads in `namespace` whose labels include `selector`.
    async fn list_workloads(&self, namespace: &str, selector: &Labels) -> Result<Vec<WorkloadSpec>>;

    /// Delete one workload.
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()>;
}
