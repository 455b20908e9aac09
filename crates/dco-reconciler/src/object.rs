//! Object identity and typed/dynamic conversion
//!
//! Controlled objects are built as typed `k8s-openapi` values and written as
//! `DynamicObject`s. Erasing a typed resource to an [`ApiResource`] is the
//! operator's type registry: it yields the group, version, kind and plural the
//! API client needs.

use std::collections::BTreeMap;
use std::fmt;

use kube::core::{ApiResource, DynamicObject};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use dco_common::{Error, Result};

/// Namespace and name of an object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<R: ResourceExt>(obj: &R) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Namespace and equality label selector for list calls
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    /// Namespace to list in, `None` for all namespaces
    pub namespace: Option<String>,
    /// Labels every listed object must carry
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    /// Select objects in `namespace` carrying all of `labels`
    pub fn new(namespace: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            labels,
        }
    }

    /// Label selector query string, e.g. `app=dask,component=worker`
    pub fn label_selector(&self) -> String {
        dco_common::metadata::selector_string(&self.labels)
    }

    /// Whether an object's labels satisfy the selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|have| have == v))
    }
}

/// A controlled object identified by type and key, used for deletion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlledRef {
    /// Type of the object
    pub resource: ApiResource,
    /// Where the object lives
    pub key: ObjectKey,
}

impl ControlledRef {
    /// Reference a typed object by its name and namespace
    pub fn of<T: Resource<DynamicType = ()>>(obj: &T) -> Self {
        Self {
            resource: ApiResource::erase::<T>(&()),
            key: ObjectKey::of(obj),
        }
    }
}

/// Convert a typed resource into a `DynamicObject`, stamping apiVersion and kind
pub fn to_dynamic<T>(obj: &T) -> Result<DynamicObject>
where
    T: Resource<DynamicType = ()> + Serialize,
{
    let kind = T::kind(&()).to_string();
    let mut value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for(kind.clone(), e.to_string()))?;
    if let Some(map) = value.as_object_mut() {
        map.insert(
            "apiVersion".to_string(),
            T::api_version(&()).to_string().into(),
        );
        map.insert("kind".to_string(), kind.clone().into());
    }
    serde_json::from_value(value).map_err(|e| Error::serialization_for(kind, e.to_string()))
}

/// Convert a `DynamicObject` read from the API back into a typed resource
pub fn from_dynamic<T>(obj: &DynamicObject) -> Result<T>
where
    T: Resource<DynamicType = ()> + DeserializeOwned,
{
    let kind = T::kind(&()).to_string();
    let value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for(kind.clone(), e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::serialization_for(kind, e.to_string()))
}
