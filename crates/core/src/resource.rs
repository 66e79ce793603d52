//! Rendered resources and the narrow capabilities the planner and conflict resolver rely on.

use std::collections::BTreeSet;

use k8s_openapi::api::autoscaling::{v1 as autoscaling_v1, v2 as autoscaling_v2};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{Error, ObjectRef, ResourceId, Result};

pub const OWNER_NAME_LABEL: &str = "kustodian.dev/name";
pub const OWNER_NAMESPACE_LABEL: &str = "kustodian.dev/namespace";
pub const PRUNE_ANNOTATION: &str = "kustodian.dev/prune";
pub const PRUNE_DISABLED: &str = "disabled";
pub const AUTOSCALER_KIND: &str = "HorizontalPodAutoscaler";

/// Anything that resolves to a canonical [`ResourceId`].
pub trait Identified {
    fn id(&self) -> ResourceId;
}

/// The workload an autoscaler scales, resolved in the autoscaler's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScaleTarget {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

pub trait HasScaleTargetRef {
    /// `Some` only for autoscalers with a well-formed `spec.scaleTargetRef`.
    fn scale_target_ref(&self) -> Option<ScaleTarget>;
}

pub trait HasReplicaField {
    fn replicas(&self) -> Option<&Json>;
    /// Drops the declared replica count; returns whether one was present.
    fn clear_replicas(&mut self) -> bool;
}

/// A fully rendered Kubernetes object. Construction validates the identity fields,
/// so accessors never have to deal with missing `apiVersion`, `kind` or `metadata.name`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Resource {
    raw: Json,
}

fn str_at<'a>(v: &'a Json, path: &[&str]) -> Option<&'a str> {
    let mut cur = v;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str()
}

impl Resource {
    pub fn from_json(raw: Json) -> Result<Self> {
        if !raw.is_object() {
            return Err(Error::input("manifest is not an object"));
        }
        let api_version = str_at(&raw, &["apiVersion"]).filter(|s| !s.is_empty());
        let kind = str_at(&raw, &["kind"]).filter(|s| !s.is_empty());
        let name = str_at(&raw, &["metadata", "name"]).filter(|s| !s.is_empty());
        match (api_version, kind, name) {
            (None, _, _) => Err(Error::input("object missing apiVersion")),
            (_, None, _) => Err(Error::input("object missing kind")),
            (_, Some(kind), None) => Err(Error::input(format!("{} missing metadata.name", kind))),
            (Some(_), Some(_), Some(_)) => Ok(Self { raw }),
        }
    }

    pub fn raw(&self) -> &Json { &self.raw }
    pub fn into_json(self) -> Json { self.raw }

    pub fn api_version(&self) -> &str { str_at(&self.raw, &["apiVersion"]).unwrap_or_default() }
    pub fn kind(&self) -> &str { str_at(&self.raw, &["kind"]).unwrap_or_default() }
    pub fn name(&self) -> &str { str_at(&self.raw, &["metadata", "name"]).unwrap_or_default() }
    /// Empty for cluster-scoped objects.
    pub fn namespace(&self) -> &str { str_at(&self.raw, &["metadata", "namespace"]).unwrap_or_default() }

    pub fn group(&self) -> &str {
        self.api_version().split_once('/').map(|(g, _)| g).unwrap_or("")
    }

    pub fn version(&self) -> &str {
        let av = self.api_version();
        av.split_once('/').map(|(_, v)| v).unwrap_or(av)
    }

    pub fn object_ref(&self) -> ObjectRef { ObjectRef::new(self.id(), self.version()) }

    pub fn is_foundational(&self) -> bool { self.id().is_foundational() }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.raw.get("metadata")?.get("annotations")?.get(key)?.as_str()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.raw.get("metadata")?.get("labels")?.get(key)?.as_str()
    }

    /// Marks the object as owned by inventory `name` in `namespace`.
    pub fn set_owner_labels(&mut self, name: &str, namespace: &str) {
        let Some(obj) = self.raw.as_object_mut() else { return };
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        let Some(meta) = meta.as_object_mut() else { return };
        let labels = meta.entry("labels").or_insert_with(|| Json::Object(Map::new()));
        if !labels.is_object() {
            *labels = Json::Object(Map::new());
        }
        if let Some(labels) = labels.as_object_mut() {
            labels.insert(OWNER_NAME_LABEL.into(), Json::String(name.to_string()));
            labels.insert(OWNER_NAMESPACE_LABEL.into(), Json::String(namespace.to_string()));
        }
    }

    /// Container images referenced by pods, pod templates, cron jobs and tekton steps.
    pub fn container_images(&self) -> BTreeSet<String> {
        const CONTAINER_LISTS: &[&[&str]] = &[
            &["spec", "containers"],
            &["spec", "initContainers"],
            &["spec", "template", "spec", "containers"],
            &["spec", "template", "spec", "initContainers"],
            &["spec", "jobTemplate", "spec", "template", "spec", "containers"],
            &["spec", "jobTemplate", "spec", "template", "spec", "initContainers"],
            &["spec", "steps"],
        ];
        let mut out = BTreeSet::new();
        for path in CONTAINER_LISTS {
            let mut cur = Some(&self.raw);
            for key in path.iter() {
                cur = cur.and_then(|v| v.get(*key));
            }
            let Some(items) = cur.and_then(Json::as_array) else { continue };
            for c in items {
                if let Some(image) = c.get("image").and_then(Json::as_str) {
                    out.insert(image.to_string());
                }
            }
        }
        out
    }
}

impl Identified for Resource {
    fn id(&self) -> ResourceId {
        ResourceId::new(self.group(), self.kind(), self.namespace(), self.name())
    }
}

/// `spec.scaleTargetRef` as every autoscaling version spells it.
#[derive(Deserialize)]
struct CrossVersionRef {
    kind: String,
    name: String,
}

impl HasScaleTargetRef for Resource {
    fn scale_target_ref(&self) -> Option<ScaleTarget> {
        if self.kind() != AUTOSCALER_KIND || self.group() != "autoscaling" {
            return None;
        }
        let (kind, name) = match self.version() {
            "v1" => {
                let hpa: autoscaling_v1::HorizontalPodAutoscaler = serde_json::from_value(self.raw.clone()).ok()?;
                let target = hpa.spec?.scale_target_ref;
                (target.kind, target.name)
            }
            "v2" => {
                let hpa: autoscaling_v2::HorizontalPodAutoscaler = serde_json::from_value(self.raw.clone()).ok()?;
                let target = hpa.spec?.scale_target_ref;
                (target.kind, target.name)
            }
            // v2beta1, v2beta2 and anything later share the reference shape
            _ => {
                let target: CrossVersionRef =
                    serde_json::from_value(self.raw.get("spec")?.get("scaleTargetRef")?.clone()).ok()?;
                (target.kind, target.name)
            }
        };
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(ScaleTarget { namespace: self.namespace().to_string(), kind, name })
    }
}

impl HasReplicaField for Resource {
    fn replicas(&self) -> Option<&Json> { self.raw.get("spec")?.get("replicas") }

    fn clear_replicas(&mut self) -> bool {
        self.raw
            .get_mut("spec")
            .and_then(Json::as_object_mut)
            .map(|spec| spec.remove("replicas").is_some())
            .unwrap_or(false)
    }
}
