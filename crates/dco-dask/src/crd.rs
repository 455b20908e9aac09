//! DaskCluster custom resource
//!
//! A DaskCluster runs one scheduler pod and a scalable set of worker pods.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, PersistentVolumeClaimSpec, PodSecurityContext, SecurityContext,
    ServicePort, Toleration, Volume, VolumeMount,
};
use k8s_openapi::ByteString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Image used when the cluster names none
pub const DEFAULT_REPOSITORY: &str = "daskdev/dask";
/// Tag used when the cluster names no image
pub const DEFAULT_TAG: &str = "2021.6.1";

/// Dask cluster running inside the custom resource's namespace.
///
/// Example:
/// ```yaml
/// apiVersion: distributed-compute.dominodatalab.com/v1alpha1
/// kind: DaskCluster
/// metadata:
///   name: analytics
/// spec:
///   image:
///     repository: daskdev/dask
///     tag: 2021.6.1
///   worker:
///     replicas: 3
///     resources:
///       requests:
///         cpu: "1"
///   networkPolicy:
///     enabled: true
///     clientLabels:
///       dask-client: "true"
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "distributed-compute.dominodatalab.com",
    version = "v1alpha1",
    kind = "DaskCluster",
    plural = "daskclusters",
    shortname = "dask",
    namespaced,
    status = "DaskClusterStatus",
    scale = r#"{"specReplicasPath":".spec.worker.replicas","statusReplicasPath":".status.workerReplicas","labelSelectorPath":".status.workerSelector"}"#,
    printcolumn = r#"{"name":"Workers","type":"integer","jsonPath":".spec.worker.replicas"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.clusterStatus"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".status.image"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DaskClusterSpec {
    /// Image run by the scheduler and every worker
    #[serde(default)]
    pub image: ImageDefinition,

    /// Names of secrets used to pull the image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    /// Service account of the cluster pods
    #[serde(default)]
    pub service_account: ServiceAccountConfig,

    /// Security context of every cluster pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<PodSecurityContext>,

    /// Environment variables set in every container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_vars: Vec<EnvVar>,

    /// Kerberos keytab mounted into every container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kerberos_keytab: Option<KerberosKeytab>,

    /// Ports client pods expose to the cluster through the proxy service;
    /// `8899/TCP` named `http-proxy` when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_client_ports: Vec<ServicePort>,

    /// Labels added to every object of the cluster
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub global_labels: BTreeMap<String, String>,

    /// Port the scheduler serves clients and workers on
    #[serde(default = "default_scheduler_port")]
    pub scheduler_port: i32,

    /// Port of the scheduler and worker dashboards
    #[serde(default = "default_dashboard_port")]
    pub dashboard_port: i32,

    /// Port workers listen on
    #[serde(default = "default_worker_port")]
    pub worker_port: i32,

    /// Port of the worker nanny process
    #[serde(default = "default_nanny_port")]
    pub nanny_port: i32,

    /// Scheduler pod configuration
    #[serde(default)]
    pub scheduler: PodConfig,

    /// Worker pod configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Horizontal autoscaling of workers; absent disables it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<Autoscaling>,

    /// Network isolation of the cluster pods
    #[serde(default)]
    pub network_policy: NetworkPolicyConfig,
}

impl Default for DaskClusterSpec {
    fn default() -> Self {
        Self {
            image: ImageDefinition::default(),
            image_pull_secrets: Vec::new(),
            service_account: ServiceAccountConfig::default(),
            pod_security_context: None,
            env_vars: Vec::new(),
            kerberos_keytab: None,
            additional_client_ports: Vec::new(),
            global_labels: BTreeMap::new(),
            scheduler_port: default_scheduler_port(),
            dashboard_port: default_dashboard_port(),
            worker_port: default_worker_port(),
            nanny_port: default_nanny_port(),
            scheduler: PodConfig::default(),
            worker: WorkerConfig::default(),
            autoscaling: None,
            network_policy: NetworkPolicyConfig::default(),
        }
    }
}

fn default_scheduler_port() -> i32 {
    8786
}

fn default_dashboard_port() -> i32 {
    8787
}

fn default_worker_port() -> i32 {
    3000
}

fn default_nanny_port() -> i32 {
    4000
}

fn default_replicas() -> i32 {
    1
}

/// OCI image reference split into its parts
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageDefinition {
    /// Registry host, e.g. `quay.io`; empty means Docker Hub
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,

    /// Repository path, e.g. `daskdev/dask`
    pub repository: String,

    /// Tag; empty means `latest`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Kubernetes image pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
}

impl Default for ImageDefinition {
    fn default() -> Self {
        Self {
            registry: None,
            repository: DEFAULT_REPOSITORY.to_string(),
            tag: Some(DEFAULT_TAG.to_string()),
            pull_policy: None,
        }
    }
}

/// Service account selection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountConfig {
    /// Existing service account to run as; the operator creates one when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Mount the API token into cluster pods
    #[serde(default)]
    pub automount_service_account_token: bool,
}

impl ServiceAccountConfig {
    /// The user-supplied service account, if any
    pub fn provided(&self) -> Option<&str> {
        self.name.as_deref().filter(|n| !n.is_empty())
    }
}

/// Keytab file shipped to the cluster pods through a ConfigMap
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KerberosKeytab {
    /// Keytab bytes, base64 in YAML
    #[schemars(with = "String")]
    pub contents: ByteString,

    /// Directory the keytab is mounted at
    pub mount_path: String,
}

/// Claim template added to a stateful set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PersistentVolumeClaimTemplate {
    /// Claim name; also the volume name containers mount
    pub name: String,

    /// Storage attributes of the claim
    pub spec: PersistentVolumeClaimSpec,
}

/// Placement and sizing of one kind of cluster pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodConfig {
    /// Extra pod labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Pod annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Node selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Container resources
    #[serde(default)]
    pub resources: Resources,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Containers run to completion before the dask container starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,

    /// Extra pod volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Extra mounts of the dask container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    /// Extra per-pod claims; removed with the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaimTemplate>,

    /// Security context of the dask container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
}

/// Container resource requests and limits, as quantities
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Resources {
    /// Minimum resources, e.g. `cpu: "500m"`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,

    /// Maximum resources
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// Worker pods
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Placement and sizing
    #[serde(flatten)]
    pub pod: PodConfig,

    /// Number of workers
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Persistent scratch space per worker; removed with the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pod: PodConfig::default(),
            replicas: default_replicas(),
            storage: None,
        }
    }
}

/// Per-worker persistent volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Volume size, e.g. `10Gi`
    pub size: String,

    /// Storage class; the cluster default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// Worker autoscaling
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Autoscaling {
    /// Lower bound on workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper bound on workers
    pub max_replicas: i32,

    /// Target average CPU utilization (percent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_cpu_utilization: Option<i32>,

    /// Target average memory utilization (percent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_memory_utilization: Option<i32>,

    /// How long recommendations are considered before scaling down (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_stabilization_window_seconds: Option<i32>,
}

/// Network isolation settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyConfig {
    /// Create network policies for the cluster pods
    #[serde(default)]
    pub enabled: bool,

    /// Labels of client pods allowed to reach the scheduler
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub client_labels: BTreeMap<String, String>,

    /// Labels of pods allowed to reach the dashboards
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dashboard_labels: BTreeMap<String, String>,

    /// Labels of namespaces whose pods may reach the dashboards
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dashboard_namespace_labels: BTreeMap<String, String>,
}

/// Observed state of a DaskCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaskClusterStatus {
    /// Names of every cluster pod, sorted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,

    /// Worker replicas of the worker stateful set
    #[serde(default)]
    pub worker_replicas: i32,

    /// Label selector of the worker pods, for the scale subresource
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worker_selector: String,

    /// Lifecycle phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_status: Option<ClusterStatus>,

    /// When the cluster last became ready (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    /// Fully qualified image reference in use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// DaskCluster lifecycle phase
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterStatus {
    /// No scheduler pod exists yet
    Pending,
    /// The scheduler pod exists but is not ready
    Starting,
    /// The scheduler pod is ready
    Running,
    /// The cluster is being deleted
    Stopping,
}
