//! ConfigMap carrying the kerberos keytab mounted into every cluster pod

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use dco_common::MetadataProvider;
use dco_reconciler::ResourceComponent;

use crate::crd::DaskCluster;

/// Key of the keytab file inside the ConfigMap
pub const KEYTAB_KEY: &str = "keytab";

/// Keeps the keytab ConfigMap in line with `spec.kerberosKeytab`; deleted
/// once the keytab is removed
pub fn keytab(meta: Arc<MetadataProvider<DaskCluster>>) -> ResourceComponent<DaskCluster, ConfigMap> {
    ResourceComponent::new(move |dc: &DaskCluster| Ok(build(&meta, dc)))
        .delete_when(|dc: &DaskCluster| dc.spec.kerberos_keytab.is_none())
}

fn build(meta: &MetadataProvider<DaskCluster>, dc: &DaskCluster) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(meta.instance_name(dc, None)),
            namespace: dc.namespace(),
            labels: Some(meta.standard_labels(dc)),
            ..Default::default()
        },
        binary_data: dc
            .spec
            .kerberos_keytab
            .as_ref()
            .map(|keytab| BTreeMap::from([(KEYTAB_KEY.to_string(), keytab.contents.clone())])),
        ..Default::default()
    }
}
