//! API client seam used by actions and the reconcile loop
//!
//! Everything the core does against the API server goes through
//! [`ObjectClient`], so reconcile passes can be driven by mocks or by the
//! in-memory server in [`crate::testing`].

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

use dco_common::{Result, OPERATOR_NAME};

use crate::object::{ObjectKey, Selector};

/// Trait abstracting untyped Kubernetes object operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Read an object; a missing object is `Ok(None)`
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// Create an object
    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object; the write carries the object's resourceVersion
    async fn replace(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Delete an object
    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<()>;

    /// List objects matching a selector
    async fn list(&self, resource: &ApiResource, selector: &Selector) -> Result<Vec<DynamicObject>>;

    /// Apply a JSON merge patch to an object's metadata
    async fn patch_metadata(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
        field_manager: &str,
    ) -> Result<DynamicObject>;

    /// Apply a JSON merge patch to an object's status subresource
    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
        field_manager: &str,
    ) -> Result<DynamicObject>;
}

/// Real implementation of ObjectClient using the kube-rs client
pub struct KubeObjectClient {
    client: Client,
}

impl KubeObjectClient {
    /// Create a new KubeObjectClient wrapping the given kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(OPERATOR_NAME.to_string()),
            ..Default::default()
        }
    }

    fn patch_params(field_manager: &str) -> PatchParams {
        PatchParams {
            field_manager: Some(field_manager.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        Ok(self
            .api(resource, key.namespace.as_deref())
            .get_opt(&key.name)
            .await?)
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        Ok(self
            .api(resource, obj.metadata.namespace.as_deref())
            .create(&Self::post_params(), obj)
            .await?)
    }

    async fn replace(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        Ok(self
            .api(resource, obj.metadata.namespace.as_deref())
            .replace(&name, &Self::post_params(), obj)
            .await?)
    }

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<()> {
        self.api(resource, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn list(&self, resource: &ApiResource, selector: &Selector) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels(&selector.label_selector());
        let list = self
            .api(resource, selector.namespace.as_deref())
            .list(&params)
            .await?;
        Ok(list.items)
    }

    async fn patch_metadata(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
        field_manager: &str,
    ) -> Result<DynamicObject> {
        Ok(self
            .api(resource, key.namespace.as_deref())
            .patch(
                &key.name,
                &Self::patch_params(field_manager),
                &Patch::Merge(patch),
            )
            .await?)
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
        field_manager: &str,
    ) -> Result<DynamicObject> {
        Ok(self
            .api(resource, key.namespace.as_deref())
            .patch_status(
                &key.name,
                &Self::patch_params(field_manager),
                &Patch::Merge(patch),
            )
            .await?)
    }
}
