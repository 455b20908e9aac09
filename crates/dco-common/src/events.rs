//! Kubernetes Events about custom resources
//!
//! Reconcilers report notable outcomes (component failures, released
//! finalizers, skipped passes) as Events on the custom resource, where they
//! show up in `kubectl describe`. Publishing never fails the caller; a
//! rejected Event is only logged.

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for Events about a custom resource
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Report `reason` for `action` on the referenced object, with an
    /// optional free-form note
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes through the `events.k8s.io` API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Events are attributed to `{controller}-controller`, with the pod name
    /// as instance when the downward API provides it.
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: format!("{controller}-controller"),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, regarding).await {
            warn!(
                object = regarding.name.as_deref().unwrap_or_default(),
                reason,
                error = %e,
                "Event rejected by API server"
            );
        }
    }
}

/// Drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _: &ObjectReference, _: EventType, _: &str, _: &str, _: Option<String>) {}
}

/// An event kept by [`RecordingEventPublisher`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Name of the object the event is about
    pub object: Option<String>,
    /// Published as `Warning` rather than `Normal`
    pub warning: bool,
    /// Machine-readable cause, one of [`reasons`]
    pub reason: String,
    /// What the controller was doing, one of [`actions`]
    pub action: String,
    /// Free-form detail
    pub note: Option<String>,
}

/// Keeps events in memory, in publish order
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Recorder with nothing published yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events carrying `reason`
    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = RecordedEvent {
            object: regarding.name.clone(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// `reason` values, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// A component step returned an error
    pub const COMPONENT_FAILED: &str = "ComponentFailed";
    /// Every component finished cleanup and the finalizers were released
    pub const FINALIZER_REMOVED: &str = "FinalizerRemoved";
    /// The skip annotation suppressed a pass
    pub const RECONCILE_SKIPPED: &str = "ReconcileSkipped";
}

/// `action` values
pub mod actions {
    /// Converging a live custom resource
    pub const RECONCILE: &str = "Reconcile";
    /// Tearing down a custom resource marked for deletion
    pub const FINALIZE: &str = "Finalize";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(name: &str) -> ObjectReference {
        ObjectReference {
            name: Some(name.to_string()),
            namespace: Some("team-a".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn recorder_keeps_publish_order() {
        let recorder = RecordingEventPublisher::new();
        recorder
            .publish(&reference("a"), EventType::Warning, reasons::COMPONENT_FAILED, actions::RECONCILE, Some("boom".into()))
            .await;
        recorder
            .publish(&reference("b"), EventType::Normal, reasons::FINALIZER_REMOVED, actions::FINALIZE, None)
            .await;

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].object.as_deref(), Some("a"));
        assert!(events[0].warning);
        assert_eq!(events[0].note.as_deref(), Some("boom"));
        assert!(!events[1].warning);
        assert_eq!(events[1].action, actions::FINALIZE);
    }

    #[tokio::test]
    async fn recorder_filters_by_reason() {
        let recorder = RecordingEventPublisher::new();
        for reason in [reasons::RECONCILE_SKIPPED, reasons::COMPONENT_FAILED, reasons::RECONCILE_SKIPPED] {
            recorder
                .publish(&reference("a"), EventType::Normal, reason, actions::RECONCILE, None)
                .await;
        }
        assert_eq!(recorder.with_reason(reasons::RECONCILE_SKIPPED).len(), 2);
        assert!(recorder.with_reason(reasons::FINALIZER_REMOVED).is_empty());
    }
}
