//! Ingress isolation of the scheduler and worker pods

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use dco_common::MetadataProvider;
use dco_reconciler::ResourceComponent;

use crate::crd::DaskCluster;
use crate::metadata::{COMPONENT_SCHEDULER, COMPONENT_WORKER};

/// Network policy admitting only cluster peers and configured clients to one
/// component; deleted while policies are disabled
pub fn component(
    meta: Arc<MetadataProvider<DaskCluster>>,
    role: &'static str,
) -> ResourceComponent<DaskCluster, NetworkPolicy> {
    ResourceComponent::new(move |dc: &DaskCluster| Ok(build(&meta, dc, role)))
        .delete_when(|dc: &DaskCluster| !dc.spec.network_policy.enabled)
}

fn build(meta: &MetadataProvider<DaskCluster>, dc: &DaskCluster, role: &str) -> NetworkPolicy {
    let ingress = if role == COMPONENT_SCHEDULER {
        scheduler_rules(meta, dc)
    } else {
        worker_rules(meta, dc)
    };
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(meta.instance_name(dc, Some(role))),
            namespace: dc.namespace(),
            labels: Some(meta.standard_labels_with_component(dc, role, None)),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: selector(meta.match_labels_with_component(dc, role)),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(ingress),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn scheduler_rules(meta: &MetadataProvider<DaskCluster>, dc: &DaskCluster) -> Vec<NetworkPolicyIngressRule> {
    let spec = &dc.spec;
    let workers = pods(meta.match_labels_with_component(dc, COMPONENT_WORKER));
    vec![
        rule(
            vec![pods(spec.network_policy.client_labels.clone()), workers],
            spec.scheduler_port,
        ),
        rule(vec![dashboard_peer(dc)], spec.dashboard_port),
    ]
}

fn worker_rules(meta: &MetadataProvider<DaskCluster>, dc: &DaskCluster) -> Vec<NetworkPolicyIngressRule> {
    let spec = &dc.spec;
    let scheduler = || pods(meta.match_labels_with_component(dc, COMPONENT_SCHEDULER));
    let workers = pods(meta.match_labels_with_component(dc, COMPONENT_WORKER));
    vec![
        rule(vec![scheduler(), workers], spec.worker_port),
        rule(vec![scheduler()], spec.nanny_port),
        rule(vec![scheduler(), dashboard_peer(dc)], spec.dashboard_port),
    ]
}

fn dashboard_peer(dc: &DaskCluster) -> NetworkPolicyPeer {
    let policy = &dc.spec.network_policy;
    NetworkPolicyPeer {
        pod_selector: Some(selector(policy.dashboard_labels.clone())),
        namespace_selector: Some(selector(policy.dashboard_namespace_labels.clone())),
        ..Default::default()
    }
}

fn pods(labels: BTreeMap<String, String>) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        pod_selector: Some(selector(labels)),
        ..Default::default()
    }
}

fn rule(from: Vec<NetworkPolicyPeer>, port: i32) -> NetworkPolicyIngressRule {
    NetworkPolicyIngressRule {
        from: Some(from),
        ports: Some(vec![NetworkPolicyPort {
            port: Some(IntOrString::Int(port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Selects everything when `labels` is empty
pub(crate) fn selector(labels: BTreeMap<String, String>) -> LabelSelector {
    LabelSelector {
        match_labels: (!labels.is_empty()).then_some(labels),
        ..Default::default()
    }
}
