//! Test custom resource

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "test.dominodatalab.com";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "test.dominodatalab.com",
    version = "v1alpha1",
    kind = "Widget",
    namespaced
)]
pub struct WidgetSpec {
    pub replicas: i32,
}

/// A widget in `team-a` that looks like it was read from the API server
pub fn widget(name: &str) -> Widget {
    let mut widget = Widget::new(name, WidgetSpec { replicas: 1 });
    widget.metadata.namespace = Some("team-a".to_string());
    widget.metadata.uid = Some(format!("uid-{name}"));
    widget
}

/// A context for one pass over `object`, talking to `client`
pub fn context(
    object: Widget,
    client: std::sync::Arc<dyn crate::client::ObjectClient>,
) -> crate::context::Context<Widget> {
    crate::context::Context::new(
        object,
        client,
        std::sync::Arc::new(crate::patch::PatchEngine::for_group(GROUP)),
        std::sync::Arc::new(dco_common::NoopEventPublisher),
        "widget",
        tracing::Span::none(),
    )
}
