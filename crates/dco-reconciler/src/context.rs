//! Per-invocation reconcile context

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use tracing::Span;

use dco_common::EventPublisher;

use crate::client::ObjectClient;
use crate::object::ObjectKey;
use crate::patch::PatchEngine;

/// Everything a component needs for one reconcile pass.
///
/// Built fresh for each invocation and dropped at its end; never shared
/// between workers.
pub struct Context<K> {
    /// The custom resource as fetched at the start of the pass
    pub object: K,
    /// API access
    pub client: Arc<dyn ObjectClient>,
    /// Diff engine bound to the custom resource's API group
    pub patch: Arc<PatchEngine>,
    /// Kubernetes event sink
    pub events: Arc<dyn EventPublisher>,
    /// Name of the controller running the pass
    pub controller: String,
    span: Span,
}

impl<K: Resource<DynamicType = ()>> Context<K> {
    pub(crate) fn new(
        object: K,
        client: Arc<dyn ObjectClient>,
        patch: Arc<PatchEngine>,
        events: Arc<dyn EventPublisher>,
        controller: impl Into<String>,
        span: Span,
    ) -> Self {
        Self {
            object,
            client,
            patch,
            events,
            controller: controller.into(),
            span,
        }
    }

    /// Namespace and name of the custom resource
    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(&self.object)
    }

    /// Object reference used when publishing events about the custom resource
    pub fn object_ref(&self) -> ObjectReference {
        self.object.object_ref(&())
    }

    /// Whether the custom resource is being deleted
    pub fn is_deleting(&self) -> bool {
        self.object.meta().deletion_timestamp.is_some()
    }

    /// Span of the whole reconcile pass; parent of every component span
    pub fn span(&self) -> &Span {
        &self.span
    }
}
