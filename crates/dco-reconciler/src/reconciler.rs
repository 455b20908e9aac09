//! The reconcile loop and its controller runtime
//!
//! One pass over a custom resource:
//!
//! 1. fetch it; a missing object means there is nothing left to do
//! 2. stop if it carries the skip annotation
//! 3. run every component in registration order, reconciling while the
//!    object is live and finalizing while it is being deleted
//! 4. write back the finalizer list with a single metadata patch
//! 5. report every component failure together
//!
//! A failing component never stops the components after it.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject, NamespaceResourceScope};
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::events::EventType;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, error, info, info_span, warn, Instrument};

use dco_common::events::{actions, reasons};
use dco_common::metrics::{self, ReconcileOutcome};
use dco_common::{Error, EventPublisher, Result};

use crate::builder::ReconcilerBuilder;
use crate::client::ObjectClient;
use crate::component::{Component, ReconcileResult};
use crate::context::Context;
use crate::object::{from_dynamic, ObjectKey};
use crate::patch::{merge_patch, PatchEngine};

/// Requeue delay after an error worth retrying quickly
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Requeue delay after an error that needs outside intervention
const SLOW_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Watch timeout (seconds); must stay below the API server's request timeout
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Registered component entry
pub(crate) struct Registration<K> {
    pub(crate) name: String,
    pub(crate) component: Box<dyn Component<K>>,
    /// Finalizer held on the custom resource, for components with cleanup
    pub(crate) finalizer: Option<String>,
}

/// Controller runtime settings
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Namespaces to watch; empty watches the whole cluster
    pub namespaces: Vec<String>,
    /// Custom resources reconciled in parallel
    pub concurrency: u16,
    /// Server-side timeout of each watch request
    pub watch_timeout_secs: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            concurrency: 4,
            watch_timeout_secs: WATCH_TIMEOUT_SECS,
        }
    }
}

/// Component pipeline for custom resources of type `K`
pub struct Reconciler<K> {
    pub(crate) client: Arc<dyn ObjectClient>,
    pub(crate) resource: ApiResource,
    pub(crate) components: Vec<Registration<K>>,
    pub(crate) patch: Arc<PatchEngine>,
    pub(crate) events: Arc<dyn EventPublisher>,
    pub(crate) controller: String,
    pub(crate) skip_annotation: String,
    pub(crate) webhooks: bool,
}

impl<K> Reconciler<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned + Send + Sync + 'static,
{
    /// Start assembling a reconciler
    pub fn builder(client: Arc<dyn ObjectClient>) -> ReconcilerBuilder<K> {
        ReconcilerBuilder::new(client)
    }

    /// Name used for the controller's spans, events and field manager
    pub fn controller_name(&self) -> &str {
        &self.controller
    }

    /// Component names in execution order
    pub fn component_names(&self) -> Vec<&str> {
        self.components.iter().map(|r| r.name.as_str()).collect()
    }

    /// Finalizers this reconciler may place on a custom resource
    pub fn finalizers(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter_map(|r| r.finalizer.as_deref())
            .collect()
    }

    /// Types of the objects produced by owned components, first occurrence first
    pub fn owned_kinds(&self) -> Vec<ApiResource> {
        let mut kinds: Vec<ApiResource> = Vec::new();
        for kind in self
            .components
            .iter()
            .filter_map(|r| r.component.as_owned())
            .map(|owned| owned.kind())
        {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }

    /// Whether admission webhooks were requested for the target type
    pub fn webhooks_enabled(&self) -> bool {
        self.webhooks
    }

    /// Run one pass over the custom resource at `key`
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileResult> {
        let span = info_span!("reconcile", controller = %self.controller, object = %key);
        let started = Instant::now();

        let result = self.reconcile_key(key, span.clone()).instrument(span).await;

        let outcome = match &result {
            Ok(_) => ReconcileOutcome::Success,
            Err(_) => ReconcileOutcome::Error,
        };
        metrics::record_reconcile(&self.controller, outcome, started.elapsed().as_secs_f64());
        result
    }

    async fn reconcile_key(&self, key: &ObjectKey, span: tracing::Span) -> Result<ReconcileResult> {
        let kind = self.resource.kind.to_lowercase();
        let live = self
            .client
            .get(&self.resource, key)
            .await
            .map_err(|e| e.with_context(format!("cannot get {kind} {key}")))?;
        let Some(live) = live else {
            debug!("Custom resource is gone, nothing to reconcile");
            return Ok(ReconcileResult::default());
        };
        let object: K = from_dynamic(&live)?;

        let ctx = Context::new(
            object,
            self.client.clone(),
            self.patch.clone(),
            self.events.clone(),
            self.controller.clone(),
            span,
        );

        if self.is_skipped(&ctx.object) {
            info!(annotation = %self.skip_annotation, "Reconcile skipped");
            self.events
                .publish(
                    &ctx.object_ref(),
                    EventType::Normal,
                    reasons::RECONCILE_SKIPPED,
                    actions::RECONCILE,
                    Some(format!("{} is set to \"true\"", self.skip_annotation)),
                )
                .await;
            return Ok(ReconcileResult::default());
        }

        let original = mutable_metadata(&ctx.object);
        let mut finalizers = ctx.object.finalizers().to_vec();
        let mut result = ReconcileResult::default();
        let mut errors = Vec::new();

        for registration in &self.components {
            let span = info_span!(parent: ctx.span(), "component", component = %registration.name);
            let step = if ctx.is_deleting() {
                self.finalize_step(&ctx, registration, &mut finalizers)
                    .instrument(span)
                    .await
            } else {
                self.reconcile_step(&ctx, registration, &mut finalizers)
                    .instrument(span)
                    .await
            };
            match step {
                Ok(step_result) => result.merge(step_result),
                Err(e) => errors.push(e),
            }
        }

        let mut updated = original.clone();
        updated["metadata"]["finalizers"] = json!(finalizers);
        let patch = merge_patch(&original, &updated);
        if patch.as_object().is_some_and(|p| !p.is_empty()) {
            if let Err(e) = self
                .client
                .patch_metadata(&self.resource, key, &patch, &self.controller)
                .await
            {
                if !e.is_not_found() {
                    errors.push(e.with_context(format!("cannot update {kind} {key} metadata")));
                }
            }
        }

        match Error::combine(errors) {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    async fn reconcile_step(
        &self,
        ctx: &Context<K>,
        registration: &Registration<K>,
        finalizers: &mut Vec<String>,
    ) -> Result<ReconcileResult> {
        let result = registration.component.reconcile(ctx).await;
        if let Some(finalizer) = &registration.finalizer {
            if !finalizers.contains(finalizer) {
                finalizers.push(finalizer.clone());
            }
        }
        if let Err(e) = &result {
            self.report_failure(ctx, &registration.name, actions::RECONCILE, e)
                .await;
        }
        result
    }

    async fn finalize_step(
        &self,
        ctx: &Context<K>,
        registration: &Registration<K>,
        finalizers: &mut Vec<String>,
    ) -> Result<ReconcileResult> {
        let (Some(finalizer), Some(component)) = (
            registration.finalizer.as_ref(),
            registration.component.as_finalizer(),
        ) else {
            return Ok(ReconcileResult::default());
        };
        if !finalizers.contains(finalizer) {
            return Ok(ReconcileResult::default());
        }

        let finalized = match component.finalize(ctx).await {
            Ok(finalized) => finalized,
            Err(e) => {
                self.report_failure(ctx, &registration.name, actions::FINALIZE, &e)
                    .await;
                return Err(e);
            }
        };

        if finalized.done {
            finalizers.retain(|f| f != finalizer);
            info!(finalizer = %finalizer, "Cleanup finished, releasing finalizer");
            self.events
                .publish(
                    &ctx.object_ref(),
                    EventType::Normal,
                    reasons::FINALIZER_REMOVED,
                    actions::FINALIZE,
                    Some(format!("{} cleanup finished", registration.name)),
                )
                .await;
        }
        Ok(finalized.result)
    }

    async fn report_failure(&self, ctx: &Context<K>, component: &str, action: &'static str, e: &Error) {
        error!(error = %e, action, "Component failed");
        metrics::record_component_error(&self.controller, component, phase(action));
        self.events
            .publish(
                &ctx.object_ref(),
                EventType::Warning,
                reasons::COMPONENT_FAILED,
                action,
                Some(format!("{component}: {e}")),
            )
            .await;
    }

    fn is_skipped(&self, obj: &K) -> bool {
        obj.annotations()
            .get(&self.skip_annotation)
            .is_some_and(|v| v == "true")
    }
}

impl<K> Reconciler<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Watch custom resources of type `K` and the kinds their components own,
    /// reconciling until a shutdown signal arrives.
    pub async fn run(self, client: Client, config: RunConfig) {
        if self.webhooks {
            info!(
                controller = %self.controller,
                "Admission webhooks requested; they are served outside the operator process"
            );
        }

        let reconciler = Arc::new(self);
        let watcher_config = WatcherConfig::default().timeout(config.watch_timeout_secs);
        let scopes: Vec<Option<String>> = if config.namespaces.is_empty() {
            vec![None]
        } else {
            config.namespaces.iter().cloned().map(Some).collect()
        };

        let controllers = scopes.into_iter().map(|namespace| {
            let api: Api<K> = match &namespace {
                Some(ns) => Api::namespaced(client.clone(), ns),
                None => Api::all(client.clone()),
            };
            info!(
                controller = %reconciler.controller,
                namespace = namespace.as_deref().unwrap_or("*"),
                "Starting controller"
            );

            let mut controller = Controller::new(api, watcher_config.clone())
                .with_config(ControllerConfig::default().concurrency(config.concurrency));
            for kind in reconciler.owned_kinds() {
                let owned: Api<DynamicObject> = match &namespace {
                    Some(ns) => Api::namespaced_with(client.clone(), ns, &kind),
                    None => Api::all_with(client.clone(), &kind),
                };
                controller = controller.owns_with(owned, kind, watcher_config.clone());
            }

            let name = reconciler.controller.clone();
            controller
                .shutdown_on_signal()
                .run(reconcile_resource, error_policy, reconciler.clone())
                .for_each(move |result| {
                    let name = name.clone();
                    async move {
                        match result {
                            Ok((obj, action)) => {
                                debug!(controller = %name, object = %obj.name, ?action, "Reconciliation completed");
                            }
                            Err(e) => {
                                error!(controller = %name, error = ?e, "Reconciliation error");
                            }
                        }
                    }
                })
        });

        futures::future::join_all(controllers).await;
        info!(controller = %reconciler.controller, "Controller stopped");
    }
}

async fn reconcile_resource<K>(obj: Arc<K>, reconciler: Arc<Reconciler<K>>) -> Result<Action>
where
    K: Resource<DynamicType = ()> + DeserializeOwned + Send + Sync + 'static,
{
    let key = ObjectKey::of(obj.as_ref());
    reconciler
        .reconcile(&key)
        .await
        .map(ReconcileResult::into_action)
}

fn error_policy<K>(obj: Arc<K>, error: &Error, reconciler: Arc<Reconciler<K>>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let delay = if error.is_retryable() {
        RETRY_DELAY
    } else {
        SLOW_RETRY_DELAY
    };
    warn!(
        controller = %reconciler.controller,
        object = %ObjectKey::of(obj.as_ref()),
        error = %error,
        retry_in = ?delay,
        "Reconcile failed, will retry"
    );
    Action::requeue(delay)
}

fn phase(action: &'static str) -> &'static str {
    if action == actions::FINALIZE {
        "finalize"
    } else {
        "reconcile"
    }
}

/// Labels, annotations and finalizers of a custom resource, shaped as an
/// object so the two-way merge patch of old and new is a metadata patch
fn mutable_metadata<K: Resource>(obj: &K) -> Value {
    json!({
        "metadata": {
            "labels": obj.labels(),
            "annotations": obj.annotations(),
            "finalizers": obj.finalizers(),
        }
    })
}
