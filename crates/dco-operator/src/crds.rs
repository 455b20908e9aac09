//! Custom resource definition lifecycle

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, CustomResourceExt, ResourceExt};
use tracing::info;

use dco_common::OPERATOR_NAME;
use dco_dask::DaskCluster;

/// Every CRD served by the operator
pub fn definitions() -> Vec<CustomResourceDefinition> {
    vec![DaskCluster::crd()]
}

/// Install or update every CRD with a forced server-side apply
pub async fn apply(client: Client) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let params = PatchParams::apply(OPERATOR_NAME).force();
    for crd in definitions() {
        let name = crd.name_any();
        api.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("cannot apply CRD {name}: {e}"))?;
        info!(crd = %name, "Applied CRD");
    }
    Ok(())
}

/// Delete every CRD; CRDs that are already gone are skipped
pub async fn delete(client: Client) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    for crd in definitions() {
        let name = crd.name_any();
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!(crd = %name, "Deleted CRD"),
            Err(kube::Error::Api(e)) if e.code == 404 => info!(crd = %name, "CRD already absent"),
            Err(e) => return Err(anyhow::anyhow!("cannot delete CRD {name}: {e}")),
        }
    }
    Ok(())
}

/// Every CRD as a multi-document YAML stream
pub fn manifests() -> anyhow::Result<String> {
    let mut out = String::new();
    for crd in definitions() {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("cannot serialize CRD {}: {e}", crd.name_any()))?;
        out.push_str("---\n");
        out.push_str(&yaml);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dask_cluster_crd_is_served_as_v1alpha1_with_subresources() {
        let crds = definitions();
        assert_eq!(crds.len(), 1);
        let crd = &crds[0];
        assert_eq!(crd.name_any(), "daskclusters.distributed-compute.dominodatalab.com");
        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        let subresources = version.subresources.as_ref().expect("subresources");
        assert!(subresources.status.is_some());
        let scale = subresources.scale.as_ref().expect("scale");
        assert_eq!(scale.spec_replicas_path, ".spec.worker.replicas");
        assert_eq!(scale.label_selector_path.as_deref(), Some(".status.workerSelector"));
    }

    #[test]
    fn manifests_are_a_yaml_stream() {
        let yaml = manifests().expect("yaml");
        assert!(yaml.starts_with("---\n"));
        assert!(yaml.contains("kind: CustomResourceDefinition"));
        assert!(yaml.contains("name: daskclusters.distributed-compute.dominodatalab.com"));
    }
}
