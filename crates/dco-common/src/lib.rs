//! Shared building blocks for the distributed compute operator
//!
//! Errors, Kubernetes events, object metadata conventions, telemetry and
//! leader election used by the reconciler core and every cluster type.

pub mod error;
pub mod events;
pub mod leader_election;
pub mod metadata;
pub mod metrics;
pub mod telemetry;

pub use error::{AggregateError, Error, Result};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher, RecordingEventPublisher};
pub use metadata::MetadataProvider;

/// API group of every custom resource served by the operator
pub const API_GROUP: &str = "distributed-compute.dominodatalab.com";

/// Name the operator uses as field manager and telemetry service name
pub const OPERATOR_NAME: &str = "distributed-compute-operator";

/// Annotation that disables reconciliation of a custom resource when `"true"`
pub const SKIP_RECONCILE_ANNOTATION: &str = "controller.dominodatalab.com/skip-reconcile";
