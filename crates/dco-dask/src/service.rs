//! Headless services in front of the scheduler and worker pods

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use dco_common::MetadataProvider;
use dco_reconciler::ResourceComponent;

use crate::crd::DaskCluster;
use crate::metadata::COMPONENT_SCHEDULER;

/// Service for one component's pods
pub fn component(
    meta: Arc<MetadataProvider<DaskCluster>>,
    role: &'static str,
) -> ResourceComponent<DaskCluster, Service> {
    ResourceComponent::new(move |dc: &DaskCluster| {
        Ok(Service {
            metadata: ObjectMeta {
                name: Some(meta.instance_name(dc, Some(role))),
                namespace: dc.namespace(),
                labels: Some(meta.standard_labels_with_component(dc, role, None)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(meta.match_labels_with_component(dc, role)),
                ports: Some(ports(dc, role)),
                ..Default::default()
            }),
            ..Default::default()
        })
    })
}

fn ports(dc: &DaskCluster, role: &str) -> Vec<ServicePort> {
    let spec = &dc.spec;
    if role == COMPONENT_SCHEDULER {
        vec![
            port("tcp-serve", spec.scheduler_port, "serve"),
            port("tcp-dashboard", spec.dashboard_port, "dashboard"),
        ]
    } else {
        vec![
            port("tcp-worker", spec.worker_port, "worker"),
            port("tcp-nanny", spec.nanny_port, "nanny"),
            port("tcp-dashboard", spec.dashboard_port, "dashboard"),
        ]
    }
}

fn port(name: &str, number: i32, target: &str) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: number,
        target_port: Some(IntOrString::String(target.to_string())),
        ..Default::default()
    }
}
