//! Standard names and labels for objects controlled by the operator
//!
//! A [`MetadataProvider`] is built once per cluster type and handed to every
//! component factory, so naming and labeling rules live in one value instead of
//! process-wide state.

use std::collections::BTreeMap;
use std::fmt;

use kube::ResourceExt;

/// Name of the application
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// Unique name identifying the instance of an application
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
/// Current version of the application
pub const LABEL_VERSION: &str = "app.kubernetes.io/version";
/// Component within the architecture of an application
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
/// Tool used to manage the application
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value of [`LABEL_MANAGED_BY`] on every object this operator creates
pub const MANAGED_BY_VALUE: &str = "distributed-compute-operator";

const MAX_LABEL_VALUE_LEN: usize = 63;

type VersionFn<K> = dyn Fn(&K) -> String + Send + Sync;
type GlobalLabelsFn<K> = dyn Fn(&K) -> BTreeMap<String, String> + Send + Sync;

/// Naming and labeling rules for one cluster type
pub struct MetadataProvider<K> {
    application: String,
    version: Box<VersionFn<K>>,
    global_labels: Box<GlobalLabelsFn<K>>,
}

impl<K> fmt::Debug for MetadataProvider<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataProvider")
            .field("application", &self.application)
            .finish_non_exhaustive()
    }
}

impl<K: ResourceExt> MetadataProvider<K> {
    /// Create a provider for `application`.
    ///
    /// `version` extracts the application version from a custom resource and
    /// `global_labels` supplies user labels applied to every controlled object.
    pub fn new(
        application: impl Into<String>,
        version: impl Fn(&K) -> String + Send + Sync + 'static,
        global_labels: impl Fn(&K) -> BTreeMap<String, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            application: application.into(),
            version: Box::new(version),
            global_labels: Box::new(global_labels),
        }
    }

    /// Application name, e.g. `dask`
    pub fn application(&self) -> &str {
        &self.application
    }

    /// Object name for a cluster component.
    ///
    /// `None` names the cluster-wide object (`{cr}-{app}`), otherwise
    /// `{cr}-{app}-{component}`.
    pub fn instance_name(&self, obj: &K, component: Option<&str>) -> String {
        match component {
            None => format!("{}-{}", obj.name_any(), self.application),
            Some(c) => format!("{}-{}-{}", obj.name_any(), self.application, c),
        }
    }

    /// Labels carried by every object of the cluster
    pub fn standard_labels(&self, obj: &K) -> BTreeMap<String, String> {
        let mut labels = (self.global_labels)(obj);
        labels.insert(LABEL_NAME.to_string(), self.application.clone());
        labels.insert(LABEL_INSTANCE.to_string(), obj.name_any());
        labels.insert(
            LABEL_VERSION.to_string(),
            sanitize_label_value(&(self.version)(obj)),
        );
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
        labels
    }

    /// Standard labels plus the component label; `extra` never overrides them
    pub fn standard_labels_with_component(
        &self,
        obj: &K,
        component: &str,
        extra: Option<&BTreeMap<String, String>>,
    ) -> BTreeMap<String, String> {
        let mut labels = extra.cloned().unwrap_or_default();
        labels.extend(self.standard_labels(obj));
        labels.insert(LABEL_COMPONENT.to_string(), component.to_string());
        labels
    }

    /// Minimal selector matching every pod of the cluster
    pub fn match_labels(&self, obj: &K) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_NAME.to_string(), self.application.clone()),
            (LABEL_INSTANCE.to_string(), obj.name_any()),
        ])
    }

    /// Selector matching the pods of one component
    pub fn match_labels_with_component(&self, obj: &K, component: &str) -> BTreeMap<String, String> {
        let mut labels = self.match_labels(obj);
        labels.insert(LABEL_COMPONENT.to_string(), component.to_string());
        labels
    }
}

/// Coerce an arbitrary string into a valid label value.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`, the result is truncated to
/// 63 characters and trimmed so it starts and ends alphanumeric.
pub fn sanitize_label_value(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_LABEL_VALUE_LEN)
        .collect();

    replaced
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Render labels as a Kubernetes equality-based selector string (`a=b,c=d`)
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
