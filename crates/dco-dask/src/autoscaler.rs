//! Horizontal autoscaling of the workers
//!
//! The autoscaler targets the DaskCluster's scale subresource rather than the
//! worker stateful set, so the custom resource stays the source of truth for
//! the worker count.

use std::sync::Arc;

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HPAScalingRules, HorizontalPodAutoscaler,
    HorizontalPodAutoscalerBehavior, HorizontalPodAutoscalerSpec, MetricSpec, MetricTarget,
    ResourceMetricSource,
};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

use dco_common::MetadataProvider;
use dco_reconciler::ResourceComponent;

use crate::crd::DaskCluster;

/// Autoscaler of the worker count; deleted while autoscaling is unset
pub fn component(
    meta: Arc<MetadataProvider<DaskCluster>>,
) -> ResourceComponent<DaskCluster, HorizontalPodAutoscaler> {
    ResourceComponent::new(move |dc: &DaskCluster| Ok(build(&meta, dc)))
        .delete_when(|dc: &DaskCluster| dc.spec.autoscaling.is_none())
}

fn build(meta: &MetadataProvider<DaskCluster>, dc: &DaskCluster) -> HorizontalPodAutoscaler {
    let scaling = dc.spec.autoscaling.clone().unwrap_or_default();

    let mut metrics = Vec::new();
    if let Some(cpu) = scaling.average_cpu_utilization {
        metrics.push(utilization("cpu", cpu));
    }
    if let Some(memory) = scaling.average_memory_utilization {
        metrics.push(utilization("memory", memory));
    }
    let behavior = scaling
        .scale_down_stabilization_window_seconds
        .map(|window| HorizontalPodAutoscalerBehavior {
            scale_down: Some(HPAScalingRules {
                stabilization_window_seconds: Some(window),
                ..Default::default()
            }),
            ..Default::default()
        });

    HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(meta.instance_name(dc, None)),
            namespace: dc.namespace(),
            labels: Some(meta.standard_labels(dc)),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some(DaskCluster::api_version(&()).to_string()),
                kind: DaskCluster::kind(&()).to_string(),
                name: dc.name_any(),
            },
            min_replicas: scaling.min_replicas,
            max_replicas: scaling.max_replicas,
            metrics: (!metrics.is_empty()).then_some(metrics),
            behavior,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn utilization(resource: &str, percent: i32) -> MetricSpec {
    MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSource {
            name: resource.to_string(),
            target: MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(percent),
                ..Default::default()
            },
        }),
        ..Default::default()
    }
}
