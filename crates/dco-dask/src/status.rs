//! Observed state of a DaskCluster
//!
//! Mirrors the cluster pods and the worker stateful set into the custom
//! resource's status, which also backs the scale subresource. The status is
//! only written when a field changed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::core::ApiResource;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info};

use dco_common::metadata::selector_string;
use dco_common::{Error, MetadataProvider, Result, OPERATOR_NAME};
use dco_reconciler::object::from_dynamic;
use dco_reconciler::patch::merge_patch;
use dco_reconciler::{
    Component, Context, Finalized, FinalizerComponent, ObjectKey, ReconcileResult, Selector,
};

use crate::crd::{ClusterStatus, DaskCluster, DaskClusterStatus};
use crate::metadata::{image_reference, COMPONENT_SCHEDULER, COMPONENT_WORKER};

/// Keeps `.status` in line with the running cluster and marks it stopping
/// while it is torn down
pub struct ClusterStatusUpdate {
    meta: Arc<MetadataProvider<DaskCluster>>,
}

impl ClusterStatusUpdate {
    /// Status step naming pods and stateful sets through `meta`
    pub fn new(meta: Arc<MetadataProvider<DaskCluster>>) -> Self {
        Self { meta }
    }

    async fn observe(&self, ctx: &Context<DaskCluster>, status: &mut DaskClusterStatus) -> Result<()> {
        let dc = &ctx.object;
        let namespace = dc.namespace().unwrap_or_default();

        let pods = ctx
            .client
            .list(
                &ApiResource::erase::<Pod>(&()),
                &Selector::new(namespace.clone(), self.meta.match_labels(dc)),
            )
            .await
            .map_err(|e| e.with_context("cannot list cluster pods"))?
            .iter()
            .map(from_dynamic::<Pod>)
            .collect::<Result<Vec<_>>>()?;

        let mut nodes: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
        nodes.sort();
        status.nodes = nodes;

        let workers = ObjectKey::namespaced(namespace, self.meta.instance_name(dc, Some(COMPONENT_WORKER)));
        let stateful_set = ctx
            .client
            .get(&ApiResource::erase::<StatefulSet>(&()), &workers)
            .await
            .map_err(|e| e.with_context(format!("cannot get statefulset {workers}")))?;
        if let Some(spec) = stateful_set
            .as_ref()
            .map(from_dynamic::<StatefulSet>)
            .transpose()?
            .and_then(|sts| sts.spec)
        {
            status.worker_selector = selector_string(&spec.selector.match_labels.unwrap_or_default());
            status.worker_replicas = spec.replicas.unwrap_or_default();
        }

        status.image = Some(image_reference(dc)?);

        let scheduler_suffix = format!("-{COMPONENT_SCHEDULER}");
        let phase = match pods.iter().find(|p| p.name_any().contains(&scheduler_suffix)) {
            Some(pod) if is_ready(pod) => ClusterStatus::Running,
            Some(_) => ClusterStatus::Starting,
            None => ClusterStatus::Pending,
        };
        if status.cluster_status != Some(phase) && !ctx.is_deleting() {
            status.cluster_status = Some(phase);
            status.start_time = (phase == ClusterStatus::Running)
                .then(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        Ok(())
    }
}

#[async_trait]
impl Component<DaskCluster> for ClusterStatusUpdate {
    async fn reconcile(&self, ctx: &Context<DaskCluster>) -> Result<ReconcileResult> {
        let current = ctx.object.status.clone().unwrap_or_default();
        let mut observed = current.clone();
        self.observe(ctx, &mut observed).await?;

        if observed == current {
            debug!("Cluster status unchanged");
        } else {
            write_status(ctx, &current, &observed).await?;
        }
        Ok(ReconcileResult::default())
    }

    fn as_finalizer(&self) -> Option<&dyn FinalizerComponent<DaskCluster>> {
        Some(self)
    }
}

#[async_trait]
impl FinalizerComponent<DaskCluster> for ClusterStatusUpdate {
    async fn finalize(&self, ctx: &Context<DaskCluster>) -> Result<Finalized> {
        let current = ctx.object.status.clone().unwrap_or_default();
        if current.cluster_status != Some(ClusterStatus::Stopping) {
            let stopping = DaskClusterStatus {
                cluster_status: Some(ClusterStatus::Stopping),
                start_time: None,
                ..current.clone()
            };
            write_status(ctx, &current, &stopping).await?;
            info!("Cluster is stopping");
        }
        Ok(Finalized::done())
    }
}

async fn write_status(
    ctx: &Context<DaskCluster>,
    current: &DaskClusterStatus,
    desired: &DaskClusterStatus,
) -> Result<()> {
    let to_json = |status: &DaskClusterStatus| {
        serde_json::to_value(status).map_err(|e| Error::serialization_for("DaskClusterStatus", e.to_string()))
    };
    let patch = merge_patch(
        &json!({ "status": to_json(current)? }),
        &json!({ "status": to_json(desired)? }),
    );
    ctx.client
        .patch_status(&ApiResource::erase::<DaskCluster>(&()), &ctx.key(), &patch, OPERATOR_NAME)
        .await
        .map_err(|e| e.with_context("cannot update cluster status"))?;
    debug!(?desired, "Updated cluster status");
    Ok(())
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}
