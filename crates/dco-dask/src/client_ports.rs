//! Reachability of client pods from the cluster
//!
//! Dask workers call back into the client that submitted work. The proxy
//! service fronts the pods matching `networkPolicy.clientLabels` on the
//! configured client ports, and the proxy policy admits cluster pods to those
//! ports. Both need client labels: an empty selector would match every pod in
//! the namespace.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use dco_common::MetadataProvider;
use dco_reconciler::ResourceComponent;

use crate::crd::DaskCluster;
use crate::metadata::COMPONENT_PROXY;
use crate::network_policy::selector;

const DEFAULT_PORT: i32 = 8899;
const DEFAULT_PORT_NAME: &str = "http-proxy";

/// ClusterIP service in front of the client pods
pub fn service(meta: Arc<MetadataProvider<DaskCluster>>) -> ResourceComponent<DaskCluster, Service> {
    ResourceComponent::new(move |dc: &DaskCluster| {
        Ok(Service {
            metadata: object_meta(&meta, dc),
            spec: Some(ServiceSpec {
                selector: Some(dc.spec.network_policy.client_labels.clone()),
                ports: Some(client_ports(dc)),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
    })
    .delete_when(|dc: &DaskCluster| without_clients(dc))
}

/// Ingress policy letting cluster pods reach the client ports; kept only
/// while network policies are enabled
pub fn network_policy(
    meta: Arc<MetadataProvider<DaskCluster>>,
) -> ResourceComponent<DaskCluster, NetworkPolicy> {
    ResourceComponent::new(move |dc: &DaskCluster| Ok(policy(&meta, dc)))
        .delete_when(|dc: &DaskCluster| without_clients(dc) || !dc.spec.network_policy.enabled)
}

fn without_clients(dc: &DaskCluster) -> bool {
    dc.spec.network_policy.client_labels.is_empty()
}

fn object_meta(meta: &MetadataProvider<DaskCluster>, dc: &DaskCluster) -> ObjectMeta {
    ObjectMeta {
        name: Some(meta.instance_name(dc, Some(COMPONENT_PROXY))),
        namespace: dc.namespace(),
        labels: Some(meta.standard_labels_with_component(dc, COMPONENT_PROXY, None)),
        ..Default::default()
    }
}

fn policy(meta: &MetadataProvider<DaskCluster>, dc: &DaskCluster) -> NetworkPolicy {
    let ports = client_ports(dc)
        .into_iter()
        .map(|p| NetworkPolicyPort {
            port: Some(p.target_port.unwrap_or(IntOrString::Int(p.port))),
            protocol: Some(p.protocol.unwrap_or_else(|| "TCP".to_string())),
            ..Default::default()
        })
        .collect();

    NetworkPolicy {
        metadata: object_meta(meta, dc),
        spec: Some(NetworkPolicySpec {
            pod_selector: selector(dc.spec.network_policy.client_labels.clone()),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    pod_selector: Some(selector(meta.match_labels(dc))),
                    ..Default::default()
                }]),
                ports: Some(ports),
            }]),
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn client_ports(dc: &DaskCluster) -> Vec<ServicePort> {
    if !dc.spec.additional_client_ports.is_empty() {
        return dc.spec.additional_client_ports.clone();
    }
    vec![ServicePort {
        name: Some(DEFAULT_PORT_NAME.to_string()),
        port: DEFAULT_PORT,
        target_port: Some(IntOrString::Int(DEFAULT_PORT)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::crd::DaskClusterSpec;
    use crate::metadata::provider;

    fn cluster(client_labels: &[(&str, &str)]) -> DaskCluster {
        let mut dc = DaskCluster::new("analytics", DaskClusterSpec::default());
        dc.metadata.namespace = Some("team-a".to_string());
        dc.spec.network_policy.client_labels = client_labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>();
        dc
    }

    #[test]
    fn proxy_port_is_used_when_none_are_listed() {
        let ports = client_ports(&cluster(&[]));
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("http-proxy"));
        assert_eq!(ports[0].port, 8899);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(8899)));
    }

    #[test]
    fn policy_admits_cluster_pods_to_each_target_port() {
        let mut dc = cluster(&[("dask-client", "true")]);
        dc.spec.additional_client_ports = vec![
            ServicePort {
                name: Some("grpc".to_string()),
                port: 5000,
                target_port: Some(IntOrString::Int(5001)),
                ..Default::default()
            },
            ServicePort {
                name: Some("stats".to_string()),
                port: 9125,
                protocol: Some("UDP".to_string()),
                ..Default::default()
            },
        ];
        let policy = policy(&provider(), &dc);
        assert_eq!(policy.metadata.name.as_deref(), Some("analytics-dask-proxy"));

        let spec = policy.spec.expect("spec");
        let clients = spec.pod_selector.match_labels.expect("client selector");
        assert_eq!(clients["dask-client"], "true");

        let ingress = spec.ingress.expect("ingress");
        let rule = &ingress[0];
        let peer = rule.from.as_ref().expect("from")[0].pod_selector.clone().expect("peer");
        let cluster_pods = peer.match_labels.expect("cluster labels");
        assert_eq!(cluster_pods["app.kubernetes.io/instance"], "analytics");
        assert!(!cluster_pods.contains_key("app.kubernetes.io/component"));

        let ports: Vec<_> = rule
            .ports
            .iter()
            .flatten()
            .map(|p| (p.port.clone(), p.protocol.clone()))
            .collect();
        assert_eq!(
            ports,
            vec![
                (Some(IntOrString::Int(5001)), Some("TCP".to_string())),
                (Some(IntOrString::Int(9125)), Some("UDP".to_string())),
            ]
        );
    }
}
