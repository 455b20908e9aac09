//! In-memory API server for reconciler tests
//!
//! [`FakeApiServer`] implements [`ObjectClient`] over a map of objects and
//! mimics the server behavior the reconcile loop depends on: resourceVersion
//! bookkeeping with conflict detection, finalizer-gated deletion, owner-based
//! garbage collection, label-selector lists and JSON merge patches. Every call
//! is logged so tests can assert on exact API traffic.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{ApiResource, DynamicObject};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use dco_common::{Error, Result};

use crate::client::ObjectClient;
use crate::object::{from_dynamic, to_dynamic, ObjectKey, Selector};

/// API verb, for the operation log and failure injection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    /// Read one object
    Get,
    /// Create an object
    Create,
    /// Replace an object
    Replace,
    /// Delete an object
    Delete,
    /// List objects
    List,
    /// Merge-patch metadata
    PatchMetadata,
    /// Merge-patch status
    PatchStatus,
}

/// One logged API call
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    /// Verb of the call
    pub verb: Verb,
    /// Kind of the addressed objects
    pub kind: String,
    /// Addressed object, absent for lists
    pub key: Option<ObjectKey>,
    /// Request body for writes and patches
    pub body: Option<Value>,
}

type StoreKey = (String, String, ObjectKey);

#[derive(Default)]
struct State {
    objects: BTreeMap<StoreKey, DynamicObject>,
    log: Vec<Operation>,
    failures: Vec<(Verb, String, u16)>,
    revision: u64,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn check_failure(&self, verb: Verb, kind: &str) -> Result<()> {
        match self
            .failures
            .iter()
            .find(|(v, k, _)| *v == verb && k == kind)
        {
            Some((_, _, code)) => Err(api_error(*code, &format!("injected {verb:?} failure"))),
            None => Ok(()),
        }
    }

    /// Remove an object and everything it owns
    fn remove_cascading(&mut self, store_key: &StoreKey) {
        let Some(removed) = self.objects.remove(store_key) else {
            return;
        };
        let Some(uid) = removed.metadata.uid else {
            return;
        };
        let dependents: Vec<StoreKey> = self
            .objects
            .iter()
            .filter(|(_, obj)| {
                obj.metadata
                    .owner_references
                    .iter()
                    .flatten()
                    .any(|r| r.uid == uid)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for dependent in dependents {
            self.delete_object(&dependent);
        }
    }

    /// Delete honoring finalizers: mark for deletion while any remain
    fn delete_object(&mut self, store_key: &StoreKey) {
        let revision = self.next_revision();
        let Some(obj) = self.objects.get_mut(store_key) else {
            return;
        };
        let has_finalizers = obj
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            if obj.metadata.deletion_timestamp.is_none() {
                obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
                obj.metadata.resource_version = Some(revision);
            }
        } else {
            self.remove_cascading(store_key);
        }
    }

    /// Drop a terminating object once its last finalizer is gone
    fn collect_if_released(&mut self, store_key: &StoreKey) {
        let released = self.objects.get(store_key).is_some_and(|obj| {
            obj.metadata.deletion_timestamp.is_some()
                && obj.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty())
        });
        if released {
            self.remove_cascading(store_key);
        }
    }
}

/// In-memory stand-in for the Kubernetes API server
#[derive(Default)]
pub struct FakeApiServer {
    state: Mutex<State>,
}

impl FakeApiServer {
    /// Create an empty server
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a typed object as if it had been created by someone else
    pub fn insert<T>(&self, obj: &T) -> Result<DynamicObject>
    where
        T: Resource<DynamicType = ()> + Serialize,
    {
        let resource = ApiResource::erase::<T>(&());
        let dynamic = to_dynamic(obj)?;
        let mut state = self.state();
        let stored = admit(&mut state, &resource, dynamic);
        Ok(stored)
    }

    /// Read a stored object back as its typed form
    pub fn get_typed<T>(&self, key: &ObjectKey) -> Option<T>
    where
        T: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let resource = ApiResource::erase::<T>(&());
        let state = self.state();
        state
            .objects
            .get(&store_key(&resource, key))
            .and_then(|obj| from_dynamic(obj).ok())
    }

    /// Whether an object is stored
    pub fn contains(&self, resource: &ApiResource, key: &ObjectKey) -> bool {
        self.state().objects.contains_key(&store_key(resource, key))
    }

    /// Every stored object of a type
    pub fn objects(&self, resource: &ApiResource) -> Vec<DynamicObject> {
        self.state()
            .objects
            .iter()
            .filter(|((api_version, kind, _), _)| {
                *api_version == resource.api_version && *kind == resource.kind
            })
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    /// Edit a stored object in place, as another actor would
    pub fn mutate(&self, resource: &ApiResource, key: &ObjectKey, edit: impl FnOnce(&mut DynamicObject)) {
        let mut state = self.state();
        let revision = state.next_revision();
        if let Some(obj) = state.objects.get_mut(&store_key(resource, key)) {
            edit(obj);
            obj.metadata.resource_version = Some(revision);
        }
    }

    /// Start deleting an object the way `kubectl delete` would
    pub fn request_deletion(&self, resource: &ApiResource, key: &ObjectKey) {
        self.state().delete_object(&store_key(resource, key));
    }

    /// Make every call of `verb` against `kind` fail with `code`
    pub fn fail_on(&self, verb: Verb, kind: &str, code: u16) {
        self.state().failures.push((verb, kind.to_string(), code));
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Every call made so far
    pub fn operations(&self) -> Vec<Operation> {
        self.state().log.clone()
    }

    /// Calls of `verb` against `kind`
    pub fn operations_of(&self, verb: Verb, kind: &str) -> Vec<Operation> {
        self.state()
            .log
            .iter()
            .filter(|op| op.verb == verb && op.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of calls of `verb` against `kind`
    pub fn count(&self, verb: Verb, kind: &str) -> usize {
        self.operations_of(verb, kind).len()
    }

    /// Forget the operation log
    pub fn clear_operations(&self) {
        self.state().log.clear();
    }

    fn begin(
        &self,
        verb: Verb,
        resource: &ApiResource,
        key: Option<&ObjectKey>,
        body: Option<Value>,
    ) -> Result<MutexGuard<'_, State>> {
        let mut state = self.state();
        state.log.push(Operation {
            verb,
            kind: resource.kind.clone(),
            key: key.cloned(),
            body,
        });
        state.check_failure(verb, &resource.kind)?;
        Ok(state)
    }
}

#[async_trait]
impl ObjectClient for FakeApiServer {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let state = self.begin(Verb::Get, resource, Some(key), None)?;
        Ok(state.objects.get(&store_key(resource, key)).cloned())
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        let mut state = self.begin(Verb::Create, resource, Some(&key), Some(to_value(obj)?))?;
        if state.objects.contains_key(&store_key(resource, &key)) {
            return Err(api_error(409, &format!("{} {key} already exists", resource.kind)));
        }
        Ok(admit(&mut state, resource, obj.clone()))
    }

    async fn replace(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        let mut state = self.begin(Verb::Replace, resource, Some(&key), Some(to_value(obj)?))?;
        let revision = state.next_revision();
        let stored_key = store_key(resource, &key);
        let Some(existing) = state.objects.get_mut(&stored_key) else {
            return Err(api_error(404, &format!("{} {key} not found", resource.kind)));
        };
        if obj.metadata.resource_version != existing.metadata.resource_version {
            return Err(api_error(409, "the object has been modified"));
        }

        let mut updated = obj.clone();
        updated.metadata.uid = existing.metadata.uid.clone();
        updated.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        updated.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
        updated.metadata.resource_version = Some(revision);
        if let Some(status) = existing.data.get("status").cloned() {
            if let Some(map) = updated.data.as_object_mut() {
                map.insert("status".to_string(), status);
            }
        }
        *existing = updated.clone();
        state.collect_if_released(&stored_key);
        Ok(updated)
    }

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<()> {
        let mut state = self.begin(Verb::Delete, resource, Some(key), None)?;
        let stored_key = store_key(resource, key);
        if !state.objects.contains_key(&stored_key) {
            return Err(api_error(404, &format!("{} {key} not found", resource.kind)));
        }
        state.delete_object(&stored_key);
        Ok(())
    }

    async fn list(&self, resource: &ApiResource, selector: &Selector) -> Result<Vec<DynamicObject>> {
        let state = self.begin(Verb::List, resource, None, None)?;
        Ok(state
            .objects
            .iter()
            .filter(|((api_version, kind, key), obj)| {
                *api_version == resource.api_version
                    && *kind == resource.kind
                    && selector
                        .namespace
                        .as_ref()
                        .map_or(true, |ns| key.namespace.as_ref() == Some(ns))
                    && selector.matches(obj.metadata.labels.as_ref().unwrap_or(&BTreeMap::new()))
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn patch_metadata(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
        _field_manager: &str,
    ) -> Result<DynamicObject> {
        let mut main = patch.clone();
        if let Some(map) = main.as_object_mut() {
            map.remove("status");
        }
        self.apply_patch(Verb::PatchMetadata, resource, key, patch, &main)
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
        _field_manager: &str,
    ) -> Result<DynamicObject> {
        let status_only = match patch.get("status") {
            Some(status) => serde_json::json!({ "status": status }),
            None => serde_json::json!({}),
        };
        self.apply_patch(Verb::PatchStatus, resource, key, patch, &status_only)
    }
}

impl FakeApiServer {
    fn apply_patch(
        &self,
        verb: Verb,
        resource: &ApiResource,
        key: &ObjectKey,
        logged: &Value,
        effective: &Value,
    ) -> Result<DynamicObject> {
        let mut state = self.begin(verb, resource, Some(key), Some(logged.clone()))?;
        let revision = state.next_revision();
        let stored_key = store_key(resource, key);
        let Some(existing) = state.objects.get_mut(&stored_key) else {
            return Err(api_error(404, &format!("{} {key} not found", resource.kind)));
        };

        let mut doc = to_value(existing)?;
        json_patch::merge(&mut doc, effective);
        let mut patched: DynamicObject = serde_json::from_value(doc)?;
        patched.metadata.resource_version = Some(revision);
        *existing = patched.clone();
        state.collect_if_released(&stored_key);
        Ok(patched)
    }
}

/// `obj` as a real API server would hand it back after a write: nulls and
/// empty lists or maps dropped and a resourceVersion assigned.
///
/// [`FakeApiServer`] keeps bodies verbatim so typed reads of required but
/// empty fields keep working; diff tests that care about omitted fields run
/// the written object through this first.
pub fn server_echo(obj: &DynamicObject) -> Result<DynamicObject> {
    let mut value = to_value(obj)?;
    crate::patch::strip_empty(&mut value);
    value["metadata"]["resourceVersion"] = Value::String("1".to_string());
    Ok(serde_json::from_value(value)?)
}

fn store_key(resource: &ApiResource, key: &ObjectKey) -> StoreKey {
    (resource.api_version.clone(), resource.kind.clone(), key.clone())
}

/// Store a new object with server-assigned metadata
fn admit(state: &mut State, resource: &ApiResource, mut obj: DynamicObject) -> DynamicObject {
    let revision = state.next_revision();
    obj.metadata
        .uid
        .get_or_insert_with(|| format!("uid-{revision}"));
    obj.metadata.resource_version = Some(revision);
    obj.metadata.creation_timestamp = Some(Time(Utc::now()));
    obj.metadata.generation = Some(1);
    state
        .objects
        .insert(store_key(resource, &ObjectKey::of(&obj)), obj.clone());
    obj
}

fn to_value(obj: &DynamicObject) -> Result<Value> {
    Ok(serde_json::to_value(obj)?)
}

fn api_error(code: u16, message: &str) -> Error {
    let reason = match code {
        404 => "NotFound",
        409 => "Conflict",
        _ => "InternalError",
    };
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    }))
}
