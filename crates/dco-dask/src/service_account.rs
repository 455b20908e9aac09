//! Service account of the cluster pods

use std::sync::Arc;

use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use dco_common::MetadataProvider;
use dco_reconciler::ResourceComponent;

use crate::crd::DaskCluster;

/// Creates the cluster's service account, or deletes it once the user
/// supplies their own
pub fn component(
    meta: Arc<MetadataProvider<DaskCluster>>,
) -> ResourceComponent<DaskCluster, ServiceAccount> {
    ResourceComponent::new(move |dc: &DaskCluster| {
        Ok(ServiceAccount {
            metadata: ObjectMeta {
                name: Some(meta.instance_name(dc, None)),
                namespace: dc.namespace(),
                labels: Some(meta.standard_labels(dc)),
                ..Default::default()
            },
            automount_service_account_token: Some(
                dc.spec.service_account.automount_service_account_token,
            ),
            ..Default::default()
        })
    })
    .delete_when(|dc: &DaskCluster| dc.spec.service_account.provided().is_some())
}

/// Service account the cluster pods run as
pub fn account_name(meta: &MetadataProvider<DaskCluster>, dc: &DaskCluster) -> String {
    dc.spec
        .service_account
        .provided()
        .map(str::to_string)
        .unwrap_or_else(|| meta.instance_name(dc, None))
}
