//! Control-plane configuration, workload rendering and the rewrite applied
//! to rendered workloads before they are created.
//!
//! The renderer produces host-level static pod templates (host networking,
//! host-path credentials). [`rewrite_workload`] turns each one into a
//! cluster-scoped workload:
//! - host networking disabled
//! - object name prefixed with the cluster name, labels replaced by the
//!   cluster label set plus the rendered `component`
//! - credential volumes redirected to the provisioned bundle secrets
//! - liveness probe host overrides cleared

use std::collections::BTreeMap;
use std::net::IpAddr;

use anyhow::{ensure, Result};
use nestplane_api::{labels_for_cluster, Labels, SemanticVersion, COMPONENT_LABEL};
use serde::{Deserialize, Serialize};

use crate::provision::{CredentialBundleSet, API_SERVER_COMPONENT, API_SERVER_PORT};

/// Volume holding certificates and keys.
pub const CERTS_VOLUME: &str = "k8s-certs";

/// Volume holding kubeconfig files.
pub const KUBECONFIG_VOLUME: &str = "kubeconfig";

/// Where kubeconfig bundles are mounted after rewriting.
pub const KUBERNETES_DIR: &str = "/etc/kubernetes";

pub const CONTROLLER_MANAGER_COMPONENT: &str = "kube-controller-manager";
pub const SCHEDULER_COMPONENT: &str = "kube-scheduler";

// =============================================================================
// Control-plane configuration
// =============================================================================

/// Configuration the control-plane workloads are rendered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub datastore_endpoints: Vec<String>,
    pub certificates_dir: String,
    pub bind_address: String,
    pub bind_port: u16,
    /// Internal address of the API server endpoint.
    pub advertise_address: IpAddr,
    /// Public hostname (`<name>.<namespace>.<base-domain>`).
    pub hostname: String,
    pub service_subnet: String,
    pub dns_domain: String,
    pub authorization_modes: Vec<String>,
    pub image_repository: String,
    pub controller_manager_extra_args: BTreeMap<String, String>,
    pub scheduler_extra_args: BTreeMap<String, String>,
}

impl ControlPlaneConfig {
    /// Defaults for everything not derived from the cluster.
    pub fn new(datastore_url: String, advertise_address: IpAddr, hostname: String) -> Self {
        let extra_args: BTreeMap<String, String> =
            [("address".to_string(), "0.0.0.0".to_string())].into();

        Self {
            datastore_endpoints: vec![datastore_url],
            certificates_dir: "/pki".to_string(),
            bind_address: "0.0.0.0".to_string(),
            bind_port: API_SERVER_PORT,
            advertise_address,
            hostname,
            service_subnet: "10.96.0.0/12".to_string(),
            dns_domain: "cluster.local".to_string(),
            authorization_modes: vec!["Node".to_string(), "RBAC".to_string()],
            image_repository: "k8s.gcr.io".to_string(),
            controller_manager_extra_args: extra_args.clone(),
            scheduler_extra_args: extra_args,
        }
    }
}

// =============================================================================
// Workload model
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub path: String,
    pub port: u16,
    pub scheme: String,
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub name: String,
    pub container_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub ports: Vec<ContainerPort>,
    pub volume_mounts: Vec<VolumeMount>,
    pub liveness_probe: Option<Probe>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    HostPath { path: String },
    Secret { secret_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub source: VolumeSource,
}

/// A pod template as produced by the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodTemplate {
    pub name: String,
    pub labels: Labels,
    pub host_network: bool,
    pub containers: Vec<Container>,
    pub volumes: Vec<Volume>,
}

impl PodTemplate {
    pub fn component(&self) -> Option<&str> {
        self.labels.get(COMPONENT_LABEL).map(String::as_str)
    }
}

/// A replicated workload owned by a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub namespace: String,
    pub labels: Labels,
    pub replicas: u32,
    pub template: PodTemplate,
}

/// The three control-plane components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedWorkloads {
    pub api_server: PodTemplate,
    pub controller_manager: PodTemplate,
    pub scheduler: PodTemplate,
}

impl RenderedWorkloads {
    pub fn into_vec(self) -> Vec<PodTemplate> {
        vec![self.api_server, self.controller_manager, self.scheduler]
    }
}

// =============================================================================
// Rendering
// =============================================================================

/// Renders control-plane pod templates.
pub trait WorkloadRenderer: Send + Sync {
    fn render(
        &self,
        config: &ControlPlaneConfig,
        version: &SemanticVersion,
    ) -> Result<RenderedWorkloads>;
}

/// Renders kubeadm-style static pods.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRenderer;

impl WorkloadRenderer for DefaultRenderer {
    fn render(
        &self,
        config: &ControlPlaneConfig,
        version: &SemanticVersion,
    ) -> Result<RenderedWorkloads> {
        ensure!(
            !config.datastore_endpoints.is_empty(),
            "no datastore endpoints to render the API server against"
        );

        Ok(RenderedWorkloads {
            api_server: api_server_pod(config, version),
            controller_manager: controller_manager_pod(config, version),
            scheduler: scheduler_pod(config, version),
        })
    }
}

fn image(config: &ControlPlaneConfig, component: &str, version: &SemanticVersion) -> String {
    format!("{}/{}-amd64:{}", config.image_repository, component, version)
}

fn static_pod(component: &str, container: Container, volumes: Vec<Volume>) -> PodTemplate {
    let labels: Labels = [
        (COMPONENT_LABEL.to_string(), component.to_string()),
        ("tier".to_string(), "control-plane".to_string()),
    ]
    .into();

    PodTemplate {
        name: component.to_string(),
        labels,
        host_network: true,
        containers: vec![container],
        volumes,
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        source: VolumeSource::HostPath {
            path: path.to_string(),
        },
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: true,
    }
}

fn flags(args: &BTreeMap<String, String>) -> impl Iterator<Item = String> + '_ {
    args.iter().map(|(k, v)| format!("--{k}={v}"))
}

fn api_server_pod(config: &ControlPlaneConfig, version: &SemanticVersion) -> PodTemplate {
    let dir = &config.certificates_dir;
    let command = vec![
        API_SERVER_COMPONENT.to_string(),
        format!("--advertise-address={}", config.advertise_address),
        format!("--bind-address={}", config.bind_address),
        format!("--secure-port={}", config.bind_port),
        format!("--etcd-servers={}", config.datastore_endpoints.join(",")),
        format!("--service-cluster-ip-range={}", config.service_subnet),
        format!("--authorization-mode={}", config.authorization_modes.join(",")),
        format!("--client-ca-file={dir}/ca.crt"),
        format!("--tls-cert-file={dir}/apiserver.crt"),
        format!("--tls-private-key-file={dir}/apiserver.key"),
        format!("--service-account-key-file={dir}/sa.pub"),
        "--allow-privileged=true".to_string(),
    ];

    let container = Container {
        name: API_SERVER_COMPONENT.to_string(),
        image: image(config, API_SERVER_COMPONENT, version),
        command,
        ports: Vec::new(),
        volume_mounts: vec![mount(CERTS_VOLUME, dir), mount("ca-certs", "/etc/ssl/certs")],
        liveness_probe: Some(Probe {
            path: "/healthz".to_string(),
            port: config.bind_port,
            scheme: "HTTPS".to_string(),
            host: Some(config.advertise_address.to_string()),
        }),
    };

    static_pod(
        API_SERVER_COMPONENT,
        container,
        vec![
            host_path_volume(CERTS_VOLUME, dir),
            host_path_volume("ca-certs", "/etc/ssl/certs"),
        ],
    )
}

fn controller_manager_pod(config: &ControlPlaneConfig, version: &SemanticVersion) -> PodTemplate {
    let dir = &config.certificates_dir;
    let kubeconfig = format!("{KUBERNETES_DIR}/controller-manager.conf");
    let mut command = vec![
        CONTROLLER_MANAGER_COMPONENT.to_string(),
        format!("--kubeconfig={kubeconfig}"),
        "--leader-elect=true".to_string(),
        format!("--root-ca-file={dir}/ca.crt"),
        format!("--service-account-private-key-file={dir}/sa.key"),
        format!("--cluster-signing-cert-file={dir}/ca.crt"),
        format!("--cluster-signing-key-file={dir}/ca.key"),
    ];
    command.extend(flags(&config.controller_manager_extra_args));

    let container = Container {
        name: CONTROLLER_MANAGER_COMPONENT.to_string(),
        image: image(config, CONTROLLER_MANAGER_COMPONENT, version),
        command,
        ports: Vec::new(),
        volume_mounts: vec![mount(CERTS_VOLUME, dir), mount(KUBECONFIG_VOLUME, &kubeconfig)],
        liveness_probe: Some(Probe {
            path: "/healthz".to_string(),
            port: 10252,
            scheme: "HTTP".to_string(),
            host: Some("127.0.0.1".to_string()),
        }),
    };

    static_pod(
        CONTROLLER_MANAGER_COMPONENT,
        container,
        vec![
            host_path_volume(CERTS_VOLUME, dir),
            host_path_volume(KUBECONFIG_VOLUME, &kubeconfig),
        ],
    )
}

fn scheduler_pod(config: &ControlPlaneConfig, version: &SemanticVersion) -> PodTemplate {
    let kubeconfig = format!("{KUBERNETES_DIR}/scheduler.conf");
    let mut command = vec![
        SCHEDULER_COMPONENT.to_string(),
        format!("--kubeconfig={kubeconfig}"),
        "--leader-elect=true".to_string(),
    ];
    command.extend(flags(&config.scheduler_extra_args));

    let container = Container {
        name: SCHEDULER_COMPONENT.to_string(),
        image: image(config, SCHEDULER_COMPONENT, version),
        command,
        ports: Vec::new(),
        volume_mounts: vec![mount(KUBECONFIG_VOLUME, &kubeconfig)],
        liveness_probe: Some(Probe {
            path: "/healthz".to_string(),
            port: 10251,
            scheme: "HTTP".to_string(),
            host: Some("127.0.0.1".to_string()),
        }),
    };

    static_pod(
        SCHEDULER_COMPONENT,
        container,
        vec![host_path_volume(KUBECONFIG_VOLUME, &kubeconfig)],
    )
}

// =============================================================================
// Rewrite
// =============================================================================

/// Turn a rendered static pod into a workload owned by `cluster`.
pub fn rewrite_workload(
    cluster: &str,
    namespace: &str,
    mut pod: PodTemplate,
    bundle: &CredentialBundleSet,
) -> WorkloadSpec {
    let component = pod.component().map(str::to_string);

    pod.host_network = false;
    pod.name = format!("{}-{}", cluster, pod.name);

    let mut labels = labels_for_cluster(cluster);
    if let Some(component) = &component {
        labels.insert(COMPONENT_LABEL.to_string(), component.clone());
    }
    pod.labels = labels.clone();

    for volume in &mut pod.volumes {
        match volume.name.as_str() {
            CERTS_VOLUME => {
                volume.source = VolumeSource::Secret {
                    secret_name: bundle.certificates.clone(),
                };
            }
            KUBECONFIG_VOLUME => {
                volume.source = VolumeSource::Secret {
                    secret_name: bundle.kubeconfig.clone(),
                };
            }
            _ => {}
        }
    }

    for container in &mut pod.containers {
        for mount in &mut container.volume_mounts {
            if mount.name == KUBECONFIG_VOLUME {
                mount.mount_path = KUBERNETES_DIR.to_string();
                mount.read_only = false;
            }
        }
        if let Some(probe) = &mut container.liveness_probe {
            probe.host = None;
        }
    }

    if component.as_deref() == Some(API_SERVER_COMPONENT) {
        if let Some(server) = pod.containers.first_mut() {
            server.ports = vec![ContainerPort {
                name: "secure".to_string(),
                container_port: API_SERVER_PORT,
            }];
        }
    }

    WorkloadSpec {
        name: pod.name.clone(),
        namespace: namespace.to_string(),
        labels,
        replicas: 1,
        template: pod,
    }
}
