//! Stateful sets running the scheduler and the workers

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
    LocalObjectReference, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::json;

use dco_common::{Error, MetadataProvider, Result};
use dco_reconciler::{ResourceComponent, Selector};

use crate::crd::{DaskCluster, PodConfig, Resources};
use crate::metadata::{image_reference, COMPONENT_SCHEDULER, COMPONENT_WORKER};
use crate::service_account::account_name;

/// Name of the container in every cluster pod
pub const CONTAINER_NAME: &str = "dask";
/// Name of the per-worker scratch volume
pub const DATA_VOLUME: &str = "data";
/// Name of the volume holding the kerberos keytab
pub const KERBEROS_VOLUME: &str = "kerberos";

const FILESYSTEM: &str = "Filesystem";
const SCRATCH_DIR: &str = "/tmp";
const POD_NAME_VAR: &str = "MY_POD_NAME";

/// The scheduler: a single replica
pub fn scheduler(meta: Arc<MetadataProvider<DaskCluster>>) -> ResourceComponent<DaskCluster, StatefulSet> {
    ResourceComponent::new(move |dc: &DaskCluster| build(&meta, dc, COMPONENT_SCHEDULER))
}

/// The workers. Their claims outlive the stateful set, so they are removed
/// before the DaskCluster goes away.
pub fn worker(meta: Arc<MetadataProvider<DaskCluster>>) -> ResourceComponent<DaskCluster, StatefulSet> {
    let claims = meta.clone();
    ResourceComponent::new(move |dc: &DaskCluster| build(&meta, dc, COMPONENT_WORKER)).with_storage_cleanup(
        move |dc: &DaskCluster| Selector::new(dc.namespace().unwrap_or_default(), claims.match_labels(dc)),
    )
}

fn build(meta: &MetadataProvider<DaskCluster>, dc: &DaskCluster, role: &str) -> Result<StatefulSet> {
    let spec = &dc.spec;
    let worker = role == COMPONENT_WORKER;
    let pod = if worker { &spec.worker.pod } else { &spec.scheduler };
    let name = meta.instance_name(dc, Some(role));
    let match_labels = meta.match_labels_with_component(dc, role);
    let storage = spec.worker.storage.as_ref().filter(|_| worker);

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image_reference(dc)?),
        image_pull_policy: spec.image.pull_policy.clone(),
        args: Some(if worker {
            worker_args(meta, dc)
        } else {
            scheduler_args(dc)
        }),
        env: non_empty_vec(env(dc, worker)),
        ports: Some(ports(dc, worker)),
        resources: Some(resources(&pod.resources)),
        volume_mounts: non_empty_vec(volume_mounts(dc, pod, storage.is_some())),
        liveness_probe: Some(health_probe()),
        readiness_probe: Some(health_probe()),
        security_context: pod.security_context.clone(),
        ..Default::default()
    };

    let mut claim_templates: Vec<PersistentVolumeClaim> = pod
        .volume_claim_templates
        .iter()
        .map(|template| {
            let mut claim = template.spec.clone();
            claim.volume_mode.get_or_insert_with(|| FILESYSTEM.to_string());
            claim_template(&template.name, &match_labels, claim)
        })
        .collect();
    if let Some(storage) = storage {
        claim_templates.push(claim_template(
            DATA_VOLUME,
            &match_labels,
            PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: storage.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(storage.size.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ));
    }

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: dc.namespace(),
            labels: Some(meta.standard_labels_with_component(dc, role, None)),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(if worker { spec.worker.replicas } else { 1 }),
            service_name: name,
            selector: LabelSelector {
                match_labels: Some(match_labels),
                ..Default::default()
            },
            pod_management_policy: Some("Parallel".to_string()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: pod_template(meta, dc, role, pod, container)?,
            volume_claim_templates: non_empty_vec(claim_templates),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn pod_template(
    meta: &MetadataProvider<DaskCluster>,
    dc: &DaskCluster,
    role: &str,
    pod: &PodConfig,
    container: Container,
) -> Result<PodTemplateSpec> {
    Ok(PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(meta.standard_labels_with_component(dc, role, Some(&pod.labels))),
            annotations: non_empty(&pod.annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            service_account_name: Some(account_name(meta, dc)),
            node_selector: non_empty(&pod.node_selector),
            affinity: pod.affinity.clone(),
            tolerations: non_empty_vec(pod.tolerations.clone()),
            init_containers: non_empty_vec(pod.init_containers.clone()),
            image_pull_secrets: pull_secrets(dc)?,
            security_context: dc.spec.pod_security_context.clone(),
            volumes: non_empty_vec(volumes(meta, dc, pod)),
            containers: vec![container],
            ..Default::default()
        }),
    })
}

fn claim_template(
    name: &str,
    labels: &BTreeMap<String, String>,
    spec: PersistentVolumeClaimSpec,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}

/// User volumes, then the keytab when one is configured
fn volumes(meta: &MetadataProvider<DaskCluster>, dc: &DaskCluster, pod: &PodConfig) -> Vec<Volume> {
    let mut volumes = pod.volumes.clone();
    if dc.spec.kerberos_keytab.is_some() {
        volumes.push(Volume {
            name: KERBEROS_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: meta.instance_name(dc, None),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    volumes
}

fn volume_mounts(dc: &DaskCluster, pod: &PodConfig, scratch: bool) -> Vec<VolumeMount> {
    let mut mounts = pod.volume_mounts.clone();
    if scratch {
        mounts.push(VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: SCRATCH_DIR.to_string(),
            ..Default::default()
        });
    }
    if let Some(keytab) = &dc.spec.kerberos_keytab {
        mounts.push(VolumeMount {
            name: KERBEROS_VOLUME.to_string(),
            mount_path: keytab.mount_path.clone(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    mounts
}

fn scheduler_args(dc: &DaskCluster) -> Vec<String> {
    vec![
        "dask-scheduler".to_string(),
        format!("--port={}", dc.spec.scheduler_port),
        format!("--dashboard-address=:{}", dc.spec.dashboard_port),
    ]
}

fn worker_args(meta: &MetadataProvider<DaskCluster>, dc: &DaskCluster) -> Vec<String> {
    let spec = &dc.spec;
    vec![
        "dask-worker".to_string(),
        format!("--name=$({POD_NAME_VAR})"),
        format!("--local-directory={SCRATCH_DIR}"),
        format!("--worker-port={}", spec.worker_port),
        format!("--nanny-port={}", spec.nanny_port),
        format!("--dashboard-address=:{}", spec.dashboard_port),
        format!(
            "{}:{}",
            meta.instance_name(dc, Some(COMPONENT_SCHEDULER)),
            spec.scheduler_port
        ),
    ]
}

fn env(dc: &DaskCluster, worker: bool) -> Vec<EnvVar> {
    let mut vars = dc.spec.env_vars.clone();
    if worker {
        vars.push(EnvVar {
            name: POD_NAME_VAR.to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    vars
}

fn ports(dc: &DaskCluster, worker: bool) -> Vec<ContainerPort> {
    let spec = &dc.spec;
    let named = |name: &str, port: i32| ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    };
    if worker {
        vec![
            named("worker", spec.worker_port),
            named("nanny", spec.nanny_port),
            named("dashboard", spec.dashboard_port),
        ]
    } else {
        vec![
            named("serve", spec.scheduler_port),
            named("dashboard", spec.dashboard_port),
        ]
    }
}

fn resources(resources: &Resources) -> ResourceRequirements {
    let quantities = |m: &BTreeMap<String, String>| {
        (!m.is_empty()).then(|| {
            m.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect::<BTreeMap<_, _>>()
        })
    };
    ResourceRequirements {
        requests: quantities(&resources.requests),
        limits: quantities(&resources.limits),
        ..Default::default()
    }
}

fn health_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/health".to_string()),
            port: IntOrString::String("dashboard".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pull_secrets(dc: &DaskCluster) -> Result<Option<Vec<LocalObjectReference>>> {
    if dc.spec.image_pull_secrets.is_empty() {
        return Ok(None);
    }
    let refs: Vec<_> = dc
        .spec
        .image_pull_secrets
        .iter()
        .map(|name| json!({ "name": name }))
        .collect();
    serde_json::from_value(refs.into())
        .map(Some)
        .map_err(|e| Error::serialization_for("LocalObjectReference", e.to_string()))
}

fn non_empty(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then(|| map.clone())
}

fn non_empty_vec<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}
