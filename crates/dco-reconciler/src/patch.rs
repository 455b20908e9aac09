//! Drift detection between live and desired objects
//!
//! A controlled object is only rewritten when the desired state differs from
//! the live state in a field this controller owns. Ownership is decided with a
//! three-way comparison:
//!
//! - `modified`: the desired object produced by a component
//! - `current`: the live object read from the API server
//! - `original`: the snapshot of the last write, kept in the
//!   `{group}/last-applied` annotation
//!
//! Fields present only in `current` were defaulted by the API server or set by
//! another actor and never cause a write. Fields that disappeared between
//! `original` and `modified` are emitted as deletions. Nulls and empty lists
//! or maps are dropped from all three sides first, since the API server omits
//! them from what it returns.

use kube::core::DynamicObject;
use kube::ResourceExt;
use serde_json::{Map, Value};

use dco_common::{Error, Result};

/// Suffix of the last-applied annotation key
pub const LAST_APPLIED_SUFFIX: &str = "last-applied";

/// Field exclusions applied to both sides before diffing
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CalculateOption {
    /// Drop the top-level `status`
    IgnoreStatusFields,
    /// Drop `apiVersion`, `kind` and `status` of every `spec.volumeClaimTemplates` entry
    IgnoreVolumeClaimTemplateTypeMetaAndStatus,
    /// Drop the field at a JSON pointer, e.g. `/spec/replicas`
    IgnorePath(String),
}

impl CalculateOption {
    fn apply(&self, obj: &mut Value) {
        match self {
            Self::IgnoreStatusFields => {
                if let Some(map) = obj.as_object_mut() {
                    map.remove("status");
                }
            }
            Self::IgnoreVolumeClaimTemplateTypeMetaAndStatus => {
                let templates = obj
                    .pointer_mut("/spec/volumeClaimTemplates")
                    .and_then(Value::as_array_mut);
                for template in templates.into_iter().flatten() {
                    if let Some(map) = template.as_object_mut() {
                        for field in ["apiVersion", "kind", "status"] {
                            map.remove(field);
                        }
                    }
                }
            }
            Self::IgnorePath(pointer) => remove_pointer(obj, pointer),
        }
    }
}

/// Outcome of a diff; empty means no write is needed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchResult {
    patch: Vec<u8>,
}

impl PatchResult {
    /// True when live and desired agree on every owned field
    pub fn is_empty(&self) -> bool {
        self.patch == b"{}"
    }

    /// JSON merge patch that would bring the live object to the desired state
    pub fn patch_bytes(&self) -> &[u8] {
        &self.patch
    }
}

/// Diff engine bound to one API group's last-applied annotation.
///
/// Stateless after construction; shared by every worker.
#[derive(Clone, Debug)]
pub struct PatchEngine {
    annotation: String,
    defaults: Vec<CalculateOption>,
}

impl PatchEngine {
    /// Engine for controllers of `group`; ignores status and
    /// volume-claim-template type metadata by default
    pub fn for_group(group: &str) -> Self {
        Self {
            annotation: format!("{group}/{LAST_APPLIED_SUFFIX}"),
            defaults: vec![
                CalculateOption::IgnoreStatusFields,
                CalculateOption::IgnoreVolumeClaimTemplateTypeMetaAndStatus,
            ],
        }
    }

    /// Replace the options applied to every calculation
    pub fn with_default_options(mut self, options: Vec<CalculateOption>) -> Self {
        self.defaults = options;
        self
    }

    /// Key of the last-applied annotation
    pub fn annotation_key(&self) -> &str {
        &self.annotation
    }

    /// Record `obj` as the last state written by this controller
    pub fn set_last_applied(&self, obj: &mut DynamicObject) -> Result<()> {
        let mut snapshot = serde_json::to_value(&*obj)?;
        remove_annotation(&mut snapshot, &self.annotation);
        remove_pointer(&mut snapshot, "/metadata/resourceVersion");
        strip_empty(&mut snapshot);

        let encoded = serde_json::to_string(&snapshot)?;
        obj.annotations_mut()
            .insert(self.annotation.clone(), encoded);
        Ok(())
    }

    /// The snapshot stored on a live object, if any
    pub fn last_applied(&self, live: &DynamicObject) -> Result<Option<Value>> {
        let Some(raw) = live.annotations().get(&self.annotation) else {
            return Ok(None);
        };
        serde_json::from_str(raw).map(Some).map_err(|e| {
            Error::patch(
                kind_of(live),
                live.name_any(),
                format!("malformed {} annotation: {e}", self.annotation),
            )
        })
    }

    /// Diff `live` against `desired`.
    ///
    /// `extra` options are applied after the engine defaults.
    pub fn calculate(
        &self,
        live: &DynamicObject,
        desired: &DynamicObject,
        extra: &[CalculateOption],
    ) -> Result<PatchResult> {
        let mut current = serde_json::to_value(live)?;
        let mut modified = serde_json::to_value(desired)?;
        let mut original = self.last_applied(live)?;

        for side in [Some(&mut current), Some(&mut modified), original.as_mut()]
            .into_iter()
            .flatten()
        {
            for option in self.defaults.iter().chain(extra) {
                option.apply(side);
            }
            remove_annotation(side, &self.annotation);
            strip_empty(side);
        }

        let patch = three_way_merge_patch(original.as_ref(), &modified, &current);
        Ok(PatchResult {
            patch: serde_json::to_vec(&patch)?,
        })
    }
}

/// Three-way JSON merge patch from `current` towards `modified`.
///
/// Keys only in `current` are left alone; keys dropped since `original` are
/// set to null.
pub fn three_way_merge_patch(original: Option<&Value>, modified: &Value, current: &Value) -> Value {
    let (Value::Object(want), Value::Object(have)) = (modified, current) else {
        if subsumes(current, modified) {
            return Value::Object(Map::new());
        }
        return modified.clone();
    };

    let mut patch = Map::new();
    changes(have, want, &mut patch);
    if let Some(Value::Object(before)) = original {
        let mut removed = Map::new();
        deletions(before, want, &mut removed);
        merge_into(&mut patch, removed);
    }
    Value::Object(patch)
}

/// Two-way JSON merge patch turning `from` into `to`
pub fn merge_patch(from: &Value, to: &Value) -> Value {
    let (Value::Object(before), Value::Object(after)) = (from, to) else {
        return to.clone();
    };

    let mut patch = Map::new();
    for (key, value) in after {
        match before.get(key) {
            Some(old) if old == value => {}
            Some(old) if old.is_object() && value.is_object() => {
                patch.insert(key.clone(), merge_patch(old, value));
            }
            _ => {
                patch.insert(key.clone(), value.clone());
            }
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    Value::Object(patch)
}

/// Fields of `want` that `have` does not already satisfy
fn changes(have: &Map<String, Value>, want: &Map<String, Value>, out: &mut Map<String, Value>) {
    for (key, wanted) in want {
        match (have.get(key), wanted) {
            (Some(Value::Object(h)), Value::Object(w)) => {
                let mut nested = Map::new();
                changes(h, w, &mut nested);
                if !nested.is_empty() {
                    out.insert(key.clone(), Value::Object(nested));
                }
            }
            (Some(existing), _) if subsumes(existing, wanted) => {}
            _ => {
                out.insert(key.clone(), wanted.clone());
            }
        }
    }
}

/// Fields the last write set that the desired state no longer carries
fn deletions(before: &Map<String, Value>, want: &Map<String, Value>, out: &mut Map<String, Value>) {
    for (key, old) in before {
        match (old, want.get(key)) {
            (_, None) => {
                out.insert(key.clone(), Value::Null);
            }
            (Value::Object(o), Some(Value::Object(w))) => {
                let mut nested = Map::new();
                deletions(o, w, &mut nested);
                if !nested.is_empty() {
                    out.insert(key.clone(), Value::Object(nested));
                }
            }
            // a list entry lost a field; lists are replaced whole
            (Value::Array(_), Some(w @ Value::Array(_))) if !subsumes(w, old) => {
                out.insert(key.clone(), w.clone());
            }
            _ => {}
        }
    }
}

/// Whether `have` carries every field `want` specifies, with equal values.
///
/// Lists must match in length; their entries are compared pairwise with the
/// same rule so server-defaulted fields inside entries are tolerated.
fn subsumes(have: &Value, want: &Value) -> bool {
    match (have, want) {
        (Value::Object(h), Value::Object(w)) => w
            .iter()
            .all(|(k, wv)| h.get(k).is_some_and(|hv| subsumes(hv, wv))),
        (Value::Array(h), Value::Array(w)) => {
            h.len() == w.len() && h.iter().zip(w).all(|(hv, wv)| subsumes(hv, wv))
        }
        _ => have == want,
    }
}

/// Deep-merge `other` into `target`; values already in `target` win
fn merge_into(target: &mut Map<String, Value>, other: Map<String, Value>) {
    for (key, value) in other {
        if let Some(existing) = target.get_mut(&key) {
            if let (Value::Object(t), Value::Object(o)) = (existing, value) {
                merge_into(t, o);
            }
            continue;
        }
        target.insert(key, value);
    }
}

/// Drop nulls and empty lists or maps from every object, innermost first.
///
/// List entries are kept in place even when they end up empty, so positions
/// still line up when lists are compared.
pub(crate) fn strip_empty(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.values_mut().for_each(strip_empty);
            map.retain(|_, v| !omitted(v));
        }
        Value::Array(items) => items.iter_mut().for_each(strip_empty),
        _ => {}
    }
}

fn omitted(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn remove_annotation(obj: &mut Value, key: &str) {
    let Some(annotations) = obj
        .pointer_mut("/metadata/annotations")
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    annotations.remove(key);
    if annotations.is_empty() {
        remove_pointer(obj, "/metadata/annotations");
    }
}

fn remove_pointer(obj: &mut Value, pointer: &str) {
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        return;
    };
    let field = last.replace("~1", "/").replace("~0", "~");
    match obj.pointer_mut(parent) {
        Some(Value::Object(map)) => {
            map.remove(&field);
        }
        Some(Value::Array(items)) => {
            if let Ok(index) = field.parse::<usize>() {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        _ => {}
    }
}

fn kind_of(obj: &DynamicObject) -> String {
    obj.types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_else(|| dco_common::error::UNKNOWN_CONTEXT.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GROUP: &str = "distributed-compute.dominodatalab.com";

    fn engine() -> PatchEngine {
        PatchEngine::for_group(GROUP)
    }

    fn dynamic(value: Value) -> DynamicObject {
        serde_json::from_value(value).expect("valid object")
    }

    fn statefulset(replicas: i64) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": {
                "name": "analytics-dask-worker",
                "namespace": "team-a",
                "labels": {"app.kubernetes.io/name": "dask", "tier": "batch"}
            },
            "spec": {
                "replicas": replicas,
                "template": {
                    "spec": {
                        "containers": [{
                            "name": "worker",
                            "image": "daskdev/dask:2021.6.1",
                            "ports": [{"name": "tcp-worker", "containerPort": 3000}]
                        }]
                    }
                },
                "volumeClaimTemplates": [{
                    "metadata": {"name": "scratch"},
                    "spec": {"accessModes": ["ReadWriteOnce"]}
                }]
            }
        })
    }

    /// Desired object as written, then echoed back with server-side defaults
    fn applied(engine: &PatchEngine, desired: Value) -> (DynamicObject, DynamicObject) {
        let mut written = dynamic(desired.clone());
        engine.set_last_applied(&mut written).expect("stamp");

        let mut live = serde_json::to_value(&written).expect("serialize");
        live["metadata"]["resourceVersion"] = json!("42");
        live["metadata"]["uid"] = json!("0b1c");
        live["metadata"]["managedFields"] = json!([{"manager": "dco"}]);
        live["spec"]["podManagementPolicy"] = json!("OrderedReady");
        live["spec"]["template"]["spec"]["containers"][0]["terminationMessagePath"] =
            json!("/dev/termination-log");
        live["spec"]["template"]["spec"]["containers"][0]["ports"][0]["protocol"] = json!("TCP");
        live["spec"]["volumeClaimTemplates"][0]["apiVersion"] = json!("v1");
        live["spec"]["volumeClaimTemplates"][0]["kind"] = json!("PersistentVolumeClaim");
        live["spec"]["volumeClaimTemplates"][0]["status"] = json!({"phase": "Pending"});
        live["status"] = json!({"replicas": 3, "readyReplicas": 1});

        (dynamic(desired), dynamic(live))
    }

    fn patch_json(result: &PatchResult) -> Value {
        serde_json::from_slice(result.patch_bytes()).expect("patch is json")
    }

    #[test]
    fn annotation_key_is_namespaced_by_group() {
        assert_eq!(
            engine().annotation_key(),
            "distributed-compute.dominodatalab.com/last-applied"
        );
    }

    #[test]
    fn server_defaulted_fields_do_not_count_as_drift() {
        let engine = engine();
        let (desired, live) = applied(&engine, statefulset(3));

        let result = engine.calculate(&live, &desired, &[]).expect("diff");
        assert!(result.is_empty(), "unexpected patch {:?}", patch_json(&result));
    }

    #[test]
    fn changed_replicas_are_reported() {
        let engine = engine();
        let (_, live) = applied(&engine, statefulset(3));
        let desired = dynamic(statefulset(5));

        let result = engine.calculate(&live, &desired, &[]).expect("diff");
        assert!(!result.is_empty());
        assert_eq!(patch_json(&result), json!({"spec": {"replicas": 5}}));
    }

    #[test]
    fn dropped_fields_become_deletions() {
        let engine = engine();
        let (_, live) = applied(&engine, statefulset(3));

        let mut without_label = statefulset(3);
        without_label["metadata"]["labels"]
            .as_object_mut()
            .expect("labels")
            .remove("tier");
        let desired = dynamic(without_label);

        let result = engine.calculate(&live, &desired, &[]).expect("diff");
        assert_eq!(
            patch_json(&result),
            json!({"metadata": {"labels": {"tier": null}}})
        );
    }

    #[test]
    fn fields_removed_inside_list_entries_replace_the_list() {
        let engine = engine();
        let (_, live) = applied(&engine, statefulset(3));

        let mut no_ports = statefulset(3);
        no_ports["spec"]["template"]["spec"]["containers"][0]
            .as_object_mut()
            .expect("container")
            .remove("ports");
        let desired = dynamic(no_ports.clone());

        let result = engine.calculate(&live, &desired, &[]).expect("diff");
        let patch = patch_json(&result);
        assert_eq!(
            patch["spec"]["template"]["spec"]["containers"],
            no_ports["spec"]["template"]["spec"]["containers"]
        );
    }

    #[test]
    fn objects_without_snapshot_only_diff_additions() {
        let engine = engine();
        let live = dynamic(statefulset(3));
        let mut desired = statefulset(3);
        desired["spec"]["serviceName"] = json!("analytics-dask-worker");

        let result = engine.calculate(&live, &dynamic(desired), &[]).expect("diff");
        assert_eq!(
            patch_json(&result),
            json!({"spec": {"serviceName": "analytics-dask-worker"}})
        );
    }

    #[test]
    fn extra_ignore_paths_are_honoured() {
        let engine = engine();
        let (_, live) = applied(&engine, statefulset(3));
        let desired = dynamic(statefulset(7));

        let result = engine
            .calculate(
                &live,
                &desired,
                &[CalculateOption::IgnorePath("/spec/replicas".to_string())],
            )
            .expect("diff");
        assert!(result.is_empty());
    }

    #[test]
    fn malformed_snapshot_is_an_error_not_a_silent_match() {
        let engine = engine();
        let mut live = statefulset(3);
        live["metadata"]["annotations"][engine.annotation_key()] = json!("{not json");

        let err = engine
            .calculate(&dynamic(live), &dynamic(statefulset(3)), &[])
            .expect_err("garbage snapshot");
        assert!(matches!(err, Error::Patch { .. }));
        assert!(err.to_string().contains("analytics-dask-worker"));
    }

    #[test]
    fn snapshot_excludes_itself_and_resource_version() {
        let engine = engine();
        let mut value = statefulset(3);
        value["metadata"]["resourceVersion"] = json!("7");
        let mut obj = dynamic(value);

        engine.set_last_applied(&mut obj).expect("stamp");
        engine.set_last_applied(&mut obj).expect("restamp");

        let snapshot = engine.last_applied(&obj).expect("parse").expect("present");
        assert!(snapshot["metadata"].get("resourceVersion").is_none());
        assert!(snapshot["metadata"].get("annotations").is_none());
        assert_eq!(snapshot["spec"]["replicas"], 3);
    }

    #[test]
    fn two_way_merge_patch_sets_and_clears() {
        let from = json!({"labels": {"a": "1", "b": "2"}, "finalizers": ["x/one", "x/two"]});
        let to = json!({"labels": {"a": "1", "c": "3"}, "finalizers": ["x/one"]});
        assert_eq!(
            merge_patch(&from, &to),
            json!({"labels": {"b": null, "c": "3"}, "finalizers": ["x/one"]})
        );
        assert_eq!(merge_patch(&to, &to), json!({}));
    }

    #[test]
    fn merging_patch_into_live_reaches_desired_state() {
        let engine = engine();
        let (_, live) = applied(&engine, statefulset(3));
        let desired = statefulset(4);

        let result = engine
            .calculate(&live, &dynamic(desired.clone()), &[])
            .expect("diff");
        let mut merged = serde_json::to_value(&live).expect("serialize");
        json_patch::merge(&mut merged, &patch_json(&result));
        assert_eq!(merged["spec"]["replicas"], desired["spec"]["replicas"]);
    }

    #[test]
    fn empty_lists_and_maps_dropped_by_the_server_are_not_drift() {
        let engine = engine();
        let mut desired = statefulset(3);
        desired["spec"]["template"]["metadata"] = json!({"annotations": {}});
        desired["spec"]["template"]["spec"]["containers"][0]["env"] = json!([]);
        desired["spec"]["selector"] = json!({"matchLabels": {"app": "dask"}, "matchExpressions": []});
        desired["spec"]["template"]["spec"]["nodeSelector"] = json!({});

        let mut written = dynamic(desired.clone());
        engine.set_last_applied(&mut written).expect("stamp");
        let mut live = serde_json::to_value(&written).expect("serialize");
        live["metadata"]["resourceVersion"] = json!("12");
        live["spec"]["template"].as_object_mut().expect("template").remove("metadata");
        live["spec"]["template"]["spec"]["containers"][0]
            .as_object_mut()
            .expect("container")
            .remove("env");
        live["spec"]["template"]["spec"]
            .as_object_mut()
            .expect("pod")
            .remove("nodeSelector");
        live["spec"]["selector"]
            .as_object_mut()
            .expect("selector")
            .remove("matchExpressions");

        let result = engine.calculate(&dynamic(live), &dynamic(desired), &[]).expect("diff");
        assert!(result.is_empty(), "unexpected patch {:?}", patch_json(&result));
    }

    #[test]
    fn emptying_a_list_is_still_drift() {
        let engine = engine();
        let mut with_env = statefulset(3);
        with_env["spec"]["template"]["spec"]["containers"][0]["env"] =
            json!([{"name": "EXTRA_PIP_PACKAGES", "value": "s3fs"}]);
        let (_, live) = applied(&engine, with_env);

        let mut cleared = statefulset(3);
        cleared["spec"]["template"]["spec"]["containers"][0]["env"] = json!([]);
        let result = engine.calculate(&live, &dynamic(cleared), &[]).expect("diff");

        let patch = patch_json(&result);
        let container = &patch["spec"]["template"]["spec"]["containers"][0];
        assert!(container.get("env").is_none());
        assert_eq!(container["name"], "worker");
    }

    #[test]
    fn stripping_keeps_list_positions() {
        let mut value = json!({
            "from": [{"podSelector": {"matchLabels": {}}}, {"podSelector": {"matchLabels": {"a": "b"}}}],
            "ports": [],
            "policyTypes": ["Ingress"],
            "replicas": 0,
            "paused": false,
            "gone": null
        });
        strip_empty(&mut value);
        assert_eq!(
            value,
            json!({
                "from": [{}, {"podSelector": {"matchLabels": {"a": "b"}}}],
                "policyTypes": ["Ingress"],
                "replicas": 0,
                "paused": false
            })
        );
    }
}
