//! Ownership-aware create/update/delete primitives
//!
//! Every primitive reads before it writes, so repeated passes converge without
//! duplicate creates and unchanged objects cost a single GET.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::core::{ApiResource, DynamicObject};
use kube::Resource;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use dco_common::{metrics, Error, Result};

use crate::context::Context;
use crate::object::{to_dynamic, ControlledRef, ObjectKey, Selector};

/// Create `desired` owned by `owner` unless an object of that name exists.
///
/// Existing objects are left untouched.
pub async fn create_owned<K, O, T>(ctx: &Context<K>, owner: &O, desired: &T) -> Result<()>
where
    O: Resource<DynamicType = ()>,
    T: Resource<DynamicType = ()> + Serialize,
{
    let (resource, mut obj, key) = prepare(owner, desired)?;

    if fetch(ctx, &resource, &key).await?.is_some() {
        debug!(kind = %resource.kind, object = %key, "Controlled object exists, leaving it as is");
        return Ok(());
    }

    create(ctx, &resource, &mut obj, &key).await
}

/// Create `desired` owned by `owner`, or update the live object when it drifted
pub async fn create_or_update_owned<K, O, T>(ctx: &Context<K>, owner: &O, desired: &T) -> Result<()>
where
    O: Resource<DynamicType = ()>,
    T: Resource<DynamicType = ()> + Serialize,
{
    let (resource, mut obj, key) = prepare(owner, desired)?;

    let Some(live) = fetch(ctx, &resource, &key).await? else {
        return create(ctx, &resource, &mut obj, &key).await;
    };

    let diff = ctx.patch.calculate(&live, &obj, &[])?;
    if diff.is_empty() {
        debug!(kind = %resource.kind, object = %key, "Controlled object up to date");
        return Ok(());
    }

    ctx.patch.set_last_applied(&mut obj)?;
    obj.metadata.resource_version = live.metadata.resource_version.clone();
    preserve_server_assigned(&resource, &live, &mut obj);

    ctx.client.replace(&resource, &obj).await.map_err(|e| {
        e.with_context(format!("cannot update {} {key}", resource.kind.to_lowercase()))
    })?;
    metrics::record_patch_update(&resource.kind);
    info!(kind = %resource.kind, object = %key, "Updated controlled object");
    Ok(())
}

/// Delete each referenced object that still exists.
///
/// Missing objects are skipped and the remaining references are still
/// processed.
pub async fn delete_if_exists<K>(ctx: &Context<K>, targets: &[ControlledRef]) -> Result<()> {
    for target in targets {
        let kind = target.resource.kind.to_lowercase();
        if fetch(ctx, &target.resource, &target.key).await?.is_none() {
            continue;
        }

        match ctx.client.delete(&target.resource, &target.key).await {
            Ok(()) => info!(kind = %target.resource.kind, object = %target.key, "Deleted controlled object"),
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.with_context(format!("cannot delete {kind} {}", target.key))),
        }
    }
    Ok(())
}

/// Delete every persistent volume claim matching `selector`.
///
/// Returns how many deletions were issued; zero means no claim is left.
pub async fn delete_storage<K>(ctx: &Context<K>, selector: &Selector) -> Result<usize> {
    let resource = ApiResource::erase::<PersistentVolumeClaim>(&());
    let claims = ctx
        .client
        .list(&resource, selector)
        .await
        .map_err(|e| e.with_context("cannot list persistent volume claims"))?;

    let mut issued = 0;
    for claim in &claims {
        let key = ObjectKey::of(claim);
        match ctx.client.delete(&resource, &key).await {
            Ok(()) => {
                info!(object = %key, "Deleted persistent volume claim");
                issued += 1;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                return Err(e.with_context(format!("cannot delete persistent volume claim {key}")))
            }
        }
    }
    Ok(issued)
}

/// Erase `desired` and point its controller reference at `owner`
fn prepare<O, T>(owner: &O, desired: &T) -> Result<(ApiResource, DynamicObject, ObjectKey)>
where
    O: Resource<DynamicType = ()>,
    T: Resource<DynamicType = ()> + Serialize,
{
    let resource = ApiResource::erase::<T>(&());
    let mut obj = to_dynamic(desired)?;
    if obj.metadata.name.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::validation(
            resource.kind.clone(),
            "controlled object has no name",
        ));
    }
    set_controller_reference(owner, &mut obj)?;
    let key = ObjectKey::of(&obj);
    Ok((resource, obj, key))
}

fn set_controller_reference<O>(owner: &O, obj: &mut DynamicObject) -> Result<()>
where
    O: Resource<DynamicType = ()>,
{
    let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::validation(
            O::kind(&()).to_string(),
            "owner has no name or uid; it must be read from the API server first",
        )
    })?;

    let conflict = obj.metadata.owner_references.as_ref().and_then(|refs| {
        refs.iter()
            .find(|r| r.controller == Some(true) && r.uid != owner_ref.uid)
            .map(|other| format!("already controlled by {} {}", other.kind, other.name))
    });
    if let Some(message) = conflict {
        return Err(Error::validation(ObjectKey::of(&*obj).to_string(), message));
    }
    let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.uid != owner_ref.uid);
    refs.push(owner_ref);
    Ok(())
}

async fn fetch<K>(ctx: &Context<K>, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
    ctx.client
        .get(resource, key)
        .await
        .map_err(|e| e.with_context(format!("cannot get {} {key}", resource.kind.to_lowercase())))
}

async fn create<K>(
    ctx: &Context<K>,
    resource: &ApiResource,
    obj: &mut DynamicObject,
    key: &ObjectKey,
) -> Result<()> {
    ctx.patch.set_last_applied(obj)?;
    ctx.client.create(resource, obj).await.map_err(|e| {
        e.with_context(format!("cannot create {} {key}", resource.kind.to_lowercase()))
    })?;
    info!(kind = %resource.kind, object = %key, "Created controlled object");
    Ok(())
}

/// Copy fields the API server assigns onto the desired object
fn preserve_server_assigned(resource: &ApiResource, live: &DynamicObject, desired: &mut DynamicObject) {
    let paths: &[&[&str]] = match (resource.group.as_str(), resource.kind.as_str()) {
        ("", "Service") => &[&["spec", "clusterIP"], &["spec", "clusterIPs"]],
        ("batch", "Job") => &[
            &["spec", "selector"],
            &["spec", "template", "metadata", "labels"],
        ],
        _ => &[],
    };
    for path in paths {
        copy_path(&live.data, &mut desired.data, path);
    }
}

fn copy_path(from: &Value, to: &mut Value, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let Some(value) = path.iter().try_fold(from, |v, segment| v.get(*segment)) else {
        return;
    };

    let mut target = to;
    for segment in parents {
        let Some(map) = target.as_object_mut() else {
            return;
        };
        target = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if let Some(map) = target.as_object_mut() {
        map.insert(last.to_string(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
    use k8s_openapi::api::batch::v1::{Job, JobSpec};
    use k8s_openapi::api::core::v1::{
        Container, PodSpec, PodTemplateSpec, Service, ServiceAccount, ServiceSpec,
    };
    use kube::api::ObjectMeta;
    use mockall::predicate::always;
    use serde_json::json;

    use dco_common::NoopEventPublisher;

    use crate::client::MockObjectClient;
    use crate::fixtures::widget;
    use crate::patch::PatchEngine;
    use crate::testing::{FakeApiServer, Verb};

    fn context_with(client: Arc<dyn crate::client::ObjectClient>) -> Context<crate::fixtures::Widget> {
        Context::new(
            widget("analytics"),
            client,
            Arc::new(PatchEngine::for_group("test.dominodatalab.com")),
            Arc::new(NoopEventPublisher),
            "widget",
            tracing::Span::none(),
        )
    }

    fn statefulset(replicas: i32) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("analytics-worker".to_string()),
                namespace: Some("team-a".to_string()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                service_name: "analytics-worker".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Testing".to_string(),
            code,
        }))
    }

    #[tokio::test]
    async fn unchanged_desired_state_creates_once_and_never_updates() {
        let server = Arc::new(FakeApiServer::new());
        let ctx = context_with(server.clone());

        create_or_update_owned(&ctx, &ctx.object, &statefulset(3)).await.expect("first");
        create_or_update_owned(&ctx, &ctx.object, &statefulset(3)).await.expect("second");

        assert_eq!(server.count(Verb::Create, "StatefulSet"), 1);
        assert_eq!(server.count(Verb::Replace, "StatefulSet"), 0);
    }

    #[tokio::test]
    async fn changed_desired_state_updates_with_live_resource_version() {
        let server = Arc::new(FakeApiServer::new());
        let ctx = context_with(server.clone());

        create_or_update_owned(&ctx, &ctx.object, &statefulset(3)).await.expect("create");
        let live_version = server
            .get_typed::<StatefulSet>(&ObjectKey::namespaced("team-a", "analytics-worker"))
            .and_then(|s| s.metadata.resource_version)
            .expect("stored");

        create_or_update_owned(&ctx, &ctx.object, &statefulset(5)).await.expect("update");

        let updates = server.operations_of(Verb::Replace, "StatefulSet");
        assert_eq!(updates.len(), 1);
        let body = updates[0].body.as_ref().expect("replace carries a body");
        assert_eq!(body["metadata"]["resourceVersion"], json!(live_version));
        assert_eq!(body["spec"]["replicas"], 5);

        let stored: StatefulSet = server
            .get_typed(&ObjectKey::namespaced("team-a", "analytics-worker"))
            .expect("stored");
        assert_eq!(stored.spec.and_then(|s| s.replicas), Some(5));
    }

    #[tokio::test]
    async fn created_objects_are_owned_and_snapshotted() {
        let server = Arc::new(FakeApiServer::new());
        let ctx = context_with(server.clone());

        create_owned(&ctx, &ctx.object, &statefulset(1)).await.expect("create");

        let stored: StatefulSet = server
            .get_typed(&ObjectKey::namespaced("team-a", "analytics-worker"))
            .expect("stored");
        let owners = stored.metadata.owner_references.expect("owner refs");
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "Widget");
        assert_eq!(owners[0].controller, Some(true));
        assert!(stored
            .metadata
            .annotations
            .expect("annotations")
            .contains_key(ctx.patch.annotation_key()));
    }

    #[tokio::test]
    async fn create_owned_is_write_once() {
        let server = Arc::new(FakeApiServer::new());
        let ctx = context_with(server.clone());

        create_owned(&ctx, &ctx.object, &statefulset(1)).await.expect("create");
        create_owned(&ctx, &ctx.object, &statefulset(9)).await.expect("noop");

        assert_eq!(server.count(Verb::Create, "StatefulSet"), 1);
        assert_eq!(server.count(Verb::Replace, "StatefulSet"), 0);
        let stored: StatefulSet = server
            .get_typed(&ObjectKey::namespaced("team-a", "analytics-worker"))
            .expect("stored");
        assert_eq!(stored.spec.and_then(|s| s.replicas), Some(1));
    }

    #[tokio::test]
    async fn service_cluster_ip_survives_updates() {
        let server = Arc::new(FakeApiServer::new());
        let ctx = context_with(server.clone());
        let service = |port_name: &str| Service {
            metadata: ObjectMeta {
                name: Some("analytics-scheduler".to_string()),
                namespace: Some("team-a".to_string()),
                labels: Some([("port".to_string(), port_name.to_string())].into()),
                ..Default::default()
            },
            spec: Some(ServiceSpec::default()),
            ..Default::default()
        };

        create_or_update_owned(&ctx, &ctx.object, &service("a")).await.expect("create");
        server.mutate(
            &ApiResource::erase::<Service>(&()),
            &ObjectKey::namespaced("team-a", "analytics-scheduler"),
            |obj| obj.data["spec"]["clusterIP"] = json!("10.96.0.12"),
        );

        create_or_update_owned(&ctx, &ctx.object, &service("b")).await.expect("update");

        let updates = server.operations_of(Verb::Replace, "Service");
        assert_eq!(updates.len(), 1);
        let body = updates[0].body.as_ref().expect("body");
        assert_eq!(body["spec"]["clusterIP"], "10.96.0.12");
    }

    #[tokio::test]
    async fn job_selector_and_template_labels_survive_updates() {
        let server = Arc::new(FakeApiServer::new());
        let ctx = context_with(server.clone());
        let job = |parallelism: i32| Job {
            metadata: ObjectMeta {
                name: Some("analytics-warmup".to_string()),
                namespace: Some("team-a".to_string()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                parallelism: Some(parallelism),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "warmup".to_string(),
                            image: Some("busybox:1.36".to_string()),
                            ..Default::default()
                        }],
                        restart_policy: Some("Never".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        create_or_update_owned(&ctx, &ctx.object, &job(1)).await.expect("create");
        server.mutate(
            &ApiResource::erase::<Job>(&()),
            &ObjectKey::namespaced("team-a", "analytics-warmup"),
            |obj| {
                obj.data["spec"]["selector"] = json!({"matchLabels": {"controller-uid": "8d5c"}});
                obj.data["spec"]["template"]["metadata"] =
                    json!({"labels": {"controller-uid": "8d5c", "job-name": "analytics-warmup"}});
            },
        );

        create_or_update_owned(&ctx, &ctx.object, &job(2)).await.expect("update");

        let updates = server.operations_of(Verb::Replace, "Job");
        assert_eq!(updates.len(), 1);
        let body = updates[0].body.as_ref().expect("body");
        assert_eq!(body["spec"]["parallelism"], 2);
        assert_eq!(body["spec"]["selector"]["matchLabels"]["controller-uid"], "8d5c");
        assert_eq!(
            body["spec"]["template"]["metadata"]["labels"],
            json!({"controller-uid": "8d5c", "job-name": "analytics-warmup"})
        );
        assert_eq!(body["spec"]["template"]["spec"]["containers"][0]["name"], "warmup");
    }

    #[tokio::test]
    async fn objects_controlled_by_someone_else_are_rejected() {
        let server = Arc::new(FakeApiServer::new());
        let ctx = context_with(server.clone());
        let other = widget("other");

        let mut sa = ServiceAccount {
            metadata: ObjectMeta {
                name: Some("analytics".to_string()),
                namespace: Some("team-a".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        sa.metadata.owner_references = other.controller_owner_ref(&()).map(|r| vec![r]);

        let err = create_owned(&ctx, &ctx.object, &sa).await.expect_err("conflict");
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(server.count(Verb::Create, "ServiceAccount"), 0);
    }

    #[tokio::test]
    async fn delete_if_exists_continues_past_missing_objects() {
        let server = Arc::new(FakeApiServer::new());
        let ctx = context_with(server.clone());

        create_owned(&ctx, &ctx.object, &statefulset(1)).await.expect("create");

        let missing = ServiceAccount {
            metadata: ObjectMeta {
                name: Some("never-created".to_string()),
                namespace: Some("team-a".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        delete_if_exists(
            &ctx,
            &[ControlledRef::of(&missing), ControlledRef::of(&statefulset(1))],
        )
        .await
        .expect("delete");

        assert!(server
            .get_typed::<StatefulSet>(&ObjectKey::namespaced("team-a", "analytics-worker"))
            .is_none());
        assert_eq!(server.count(Verb::Delete, "StatefulSet"), 1);
        assert_eq!(server.count(Verb::Delete, "ServiceAccount"), 0);
    }

    #[tokio::test]
    async fn get_failures_abort_deletion() {
        let mut client = MockObjectClient::new();
        client
            .expect_get()
            .times(1)
            .returning(|_, _| Err(api_error(500)));
        client.expect_delete().never();
        let ctx = context_with(Arc::new(client));

        let err = delete_if_exists(&ctx, &[ControlledRef::of(&statefulset(1))])
            .await
            .expect_err("server error");
        assert!(err.to_string().starts_with("cannot get statefulset team-a/analytics-worker"));
    }

    #[tokio::test]
    async fn patch_errors_are_never_treated_as_no_change() {
        let mut client = MockObjectClient::new();
        client.expect_get().with(always(), always()).returning(|_, _| {
            let mut live = to_dynamic(&statefulset(3)).expect("convert");
            live.metadata.annotations = Some(
                [(
                    "test.dominodatalab.com/last-applied".to_string(),
                    "not json".to_string(),
                )]
                .into(),
            );
            Ok(Some(live))
        });
        client.expect_replace().never();
        let ctx = context_with(Arc::new(client));

        let err = create_or_update_owned(&ctx, &ctx.object, &statefulset(3))
            .await
            .expect_err("bad snapshot");
        assert!(matches!(err, Error::Patch { .. }));
    }

    #[tokio::test]
    async fn create_errors_carry_a_prefix() {
        let mut client = MockObjectClient::new();
        client.expect_get().returning(|_, _| Ok(None));
        client
            .expect_create()
            .times(1)
            .returning(|_, _| Err(api_error(409)));
        let ctx = context_with(Arc::new(client));

        let err = create_or_update_owned(&ctx, &ctx.object, &statefulset(3))
            .await
            .expect_err("conflict");
        assert!(err.is_conflict());
        assert!(err
            .to_string()
            .starts_with("cannot create statefulset team-a/analytics-worker: "));
    }

    #[tokio::test]
    async fn storage_deletion_reports_issued_deletes() {
        let server = Arc::new(FakeApiServer::new());
        let ctx = context_with(server.clone());
        let labels: std::collections::BTreeMap<String, String> =
            [("app".to_string(), "dask".to_string())].into();

        for name in ["scratch-0", "scratch-1"] {
            server
                .insert(&PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some("team-a".to_string()),
                        labels: Some(labels.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .expect("seed");
        }
        server
            .insert(&PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("unrelated".to_string()),
                    namespace: Some("team-a".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .expect("seed");

        let selector = Selector::new("team-a", labels);
        assert_eq!(delete_storage(&ctx, &selector).await.expect("delete"), 2);
        assert_eq!(delete_storage(&ctx, &selector).await.expect("recheck"), 0);
        assert!(server
            .get_typed::<PersistentVolumeClaim>(&ObjectKey::namespaced("team-a", "unrelated"))
            .is_some());
    }
}
