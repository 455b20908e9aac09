//! Reconciler assembly

use std::collections::HashSet;
use std::sync::Arc;

use kube::core::ApiResource;
use kube::Resource;

use dco_common::{
    Error, EventPublisher, NoopEventPublisher, Result, API_GROUP, SKIP_RECONCILE_ANNOTATION,
};

use crate::client::ObjectClient;
use crate::component::Component;
use crate::patch::PatchEngine;
use crate::reconciler::{Reconciler, Registration};

/// Builds a [`Reconciler`] for custom resources of type `K`
pub struct ReconcilerBuilder<K> {
    client: Arc<dyn ObjectClient>,
    components: Vec<(String, Box<dyn Component<K>>)>,
    events: Option<Arc<dyn EventPublisher>>,
    controller_name: Option<String>,
    finalizer_prefix: Option<String>,
    skip_annotation: String,
    webhooks: bool,
}

impl<K> ReconcilerBuilder<K>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    /// Start a reconciler that talks to the API server through `client`
    pub fn new(client: Arc<dyn ObjectClient>) -> Self {
        Self {
            client,
            components: Vec::new(),
            events: None,
            controller_name: None,
            finalizer_prefix: None,
            skip_annotation: SKIP_RECONCILE_ANNOTATION.to_string(),
            webhooks: false,
        }
    }

    /// Append a named step; steps run in registration order
    pub fn component(mut self, name: impl Into<String>, component: impl Component<K> + 'static) -> Self {
        self.components.push((name.into(), Box::new(component)));
        self
    }

    /// Ask for admission webhooks for the target type
    pub fn with_webhooks(mut self) -> Self {
        self.webhooks = true;
        self
    }

    /// Publish Kubernetes events through `events`
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the controller name (defaults to the lowercase kind)
    pub fn controller_name(mut self, name: impl Into<String>) -> Self {
        self.controller_name = Some(name.into());
        self
    }

    /// Override the finalizer prefix (defaults to `{controller}.{group}/`,
    /// or `{controller}.{API_GROUP}/` for core-group targets)
    pub fn finalizer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.finalizer_prefix = Some(prefix.into());
        self
    }

    /// Override the annotation that pauses reconciliation
    pub fn skip_annotation(mut self, key: impl Into<String>) -> Self {
        self.skip_annotation = key.into();
        self
    }

    /// Validate the registration and produce the reconciler.
    ///
    /// Fails with [`Error::Configuration`] when the target type has no
    /// version or kind, or when component names are empty or repeated.
    /// Core-group targets have no group of their own, so their finalizers
    /// and last-applied annotation live under [`dco_common::API_GROUP`].
    pub fn build(self) -> Result<Reconciler<K>> {
        let resource = ApiResource::erase::<K>(&());
        for (field, value) in [("version", &resource.version), ("kind", &resource.kind)] {
            if value.is_empty() {
                return Err(Error::configuration(format!(
                    "target type {} has no {field}",
                    resource.api_version
                )));
            }
        }
        let domain = match resource.group.as_str() {
            "" => API_GROUP,
            group => group,
        };

        let controller = self
            .controller_name
            .unwrap_or_else(|| resource.kind.to_lowercase());
        let prefix = self
            .finalizer_prefix
            .unwrap_or_else(|| format!("{controller}.{domain}/"));

        let mut seen = HashSet::new();
        let mut registrations = Vec::with_capacity(self.components.len());
        for (name, component) in self.components {
            if name.is_empty() {
                return Err(Error::configuration(format!(
                    "{controller}: component name must not be empty"
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(Error::configuration(format!(
                    "{controller}: duplicate component name {name:?}"
                )));
            }
            let finalizer = component
                .as_finalizer()
                .map(|_| format!("{prefix}{name}"));
            registrations.push(Registration {
                name,
                component,
                finalizer,
            });
        }

        Ok(Reconciler {
            client: self.client,
            patch: Arc::new(PatchEngine::for_group(domain)),
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            resource,
            components: registrations,
            controller,
            skip_annotation: self.skip_annotation,
            webhooks: self.webhooks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{ConfigMap, ServiceAccount};
    use kube::api::ObjectMeta;
    use kube::ResourceExt;

    use crate::component::{Finalized, FinalizerComponent, ReconcileResult};
    use crate::components::ResourceComponent;
    use crate::context::Context;
    use crate::fixtures::Widget;
    use crate::object::Selector;
    use crate::testing::FakeApiServer;

    struct Noop;

    #[async_trait]
    impl Component<Widget> for Noop {
        async fn reconcile(&self, _ctx: &Context<Widget>) -> Result<ReconcileResult> {
            Ok(ReconcileResult::default())
        }
    }

    struct Cleanup;

    #[async_trait]
    impl Component<Widget> for Cleanup {
        async fn reconcile(&self, _ctx: &Context<Widget>) -> Result<ReconcileResult> {
            Ok(ReconcileResult::default())
        }

        fn as_finalizer(&self) -> Option<&dyn FinalizerComponent<Widget>> {
            Some(self)
        }
    }

    #[async_trait]
    impl FinalizerComponent<Widget> for Cleanup {
        async fn finalize(&self, _ctx: &Context<Widget>) -> Result<Finalized> {
            Ok(Finalized::done())
        }
    }

    fn builder() -> ReconcilerBuilder<Widget> {
        ReconcilerBuilder::new(Arc::new(FakeApiServer::new()))
    }

    fn named<T: Default + Resource>(name: &str) -> T {
        let mut obj = T::default();
        *obj.meta_mut() = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("team-a".to_string()),
            ..Default::default()
        };
        obj
    }

    #[test]
    fn duplicate_component_names_are_rejected() {
        let err = builder()
            .component("serviceaccount", Noop)
            .component("service", Noop)
            .component("serviceaccount", Noop)
            .build()
            .err()
            .expect("duplicate names");
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("\"serviceaccount\""));
    }

    #[test]
    fn empty_component_names_are_rejected() {
        let result = builder().component("", Noop).build();
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn unique_names_build() {
        let reconciler = builder()
            .component("serviceaccount", Noop)
            .component("service", Noop)
            .build()
            .expect("build");
        assert_eq!(reconciler.component_names(), vec!["serviceaccount", "service"]);
        assert_eq!(reconciler.controller_name(), "widget");
        assert!(!reconciler.webhooks_enabled());
    }

    #[test]
    fn finalizers_are_namespaced_by_controller_and_group() {
        let reconciler = builder()
            .component("statusupdate", Noop)
            .component("statefulset-worker", Cleanup)
            .build()
            .expect("build");
        assert_eq!(
            reconciler.finalizers(),
            vec!["widget.test.dominodatalab.com/statefulset-worker"]
        );

        let renamed = builder()
            .controller_name("gadget")
            .finalizer_prefix("example.com/")
            .component("cleanup", Cleanup)
            .with_webhooks()
            .build()
            .expect("build");
        assert_eq!(renamed.finalizers(), vec!["example.com/cleanup"]);
        assert_eq!(renamed.controller_name(), "gadget");
        assert!(renamed.webhooks_enabled());
    }

    #[test]
    fn owned_kinds_are_deduplicated_in_registration_order() {
        let reconciler = builder()
            .component(
                "serviceaccount",
                ResourceComponent::new(|w: &Widget| Ok(named::<ServiceAccount>(&w.name_any()))),
            )
            .component(
                "config-a",
                ResourceComponent::new(|w: &Widget| Ok(named::<ConfigMap>(&format!("{}-a", w.name_any())))),
            )
            .component(
                "config-b",
                ResourceComponent::new(|w: &Widget| Ok(named::<ConfigMap>(&format!("{}-b", w.name_any()))))
                    .with_storage_cleanup(|_| Selector::default()),
            )
            .component("noop", Noop)
            .build()
            .expect("build");

        let kinds: Vec<String> = reconciler.owned_kinds().into_iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec!["ServiceAccount", "ConfigMap"]);
        assert_eq!(reconciler.finalizers(), vec!["widget.test.dominodatalab.com/config-b"]);
    }

    #[test]
    fn core_group_targets_fall_back_to_the_operator_group() {
        let reconciler = ReconcilerBuilder::<ConfigMap>::new(Arc::new(FakeApiServer::new()))
            .component(
                "serviceaccount",
                ResourceComponent::new(|cm: &ConfigMap| Ok(named::<ServiceAccount>(&cm.name_any())))
                    .with_storage_cleanup(|_| Selector::default()),
            )
            .build()
            .expect("core-group targets build");

        assert_eq!(
            reconciler.finalizers(),
            vec!["configmap.distributed-compute.dominodatalab.com/serviceaccount"]
        );
        assert_eq!(
            reconciler.patch.annotation_key(),
            "distributed-compute.dominodatalab.com/last-applied"
        );
    }
}
