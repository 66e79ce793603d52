//! Kustodian core types: resource identity, rendered resources, change reporting and errors.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod error;
mod resource;

pub use error::{DeleteFailure, Error, Result};
pub use resource::{
    HasReplicaField, HasScaleTargetRef, Identified, Resource, ScaleTarget, AUTOSCALER_KIND,
    OWNER_NAMESPACE_LABEL, OWNER_NAME_LABEL, PRUNE_ANNOTATION, PRUNE_DISABLED,
};

pub const CRD_GROUP: &str = "apiextensions.k8s.io";
pub const CRD_KIND: &str = "CustomResourceDefinition";
pub const NAMESPACE_KIND: &str = "Namespace";

/// Canonical identity of a cluster resource: `(group, kind, namespace, name)`.
///
/// An empty `group` is the core API group, an empty `namespace` a cluster-scoped
/// object. The derived ordering is only used for set membership; plan order
/// lives in the planner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self { group: group.into(), kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    pub fn is_namespaced(&self) -> bool { !self.namespace.is_empty() }

    /// Schema- or namespace-defining objects that other objects may depend on.
    pub fn is_foundational(&self) -> bool {
        (self.group == CRD_GROUP && self.kind == CRD_KIND)
            || (self.group.is_empty() && self.kind == NAMESPACE_KIND)
    }

    /// Encoded form stored in inventories: `<namespace>_<name>_<group>_<kind>`.
    pub fn encode(&self) -> String {
        format!("{}_{}_{}_{}", self.namespace, self.name, self.group, self.kind)
    }

    /// Inverse of [`ResourceId::encode`]. Kubernetes names, groups and kinds never contain `_`,
    /// so anything that does not split into exactly four parts is rejected.
    pub fn decode(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('_').collect();
        match parts.as_slice() {
            [ns, name, group, kind] if !name.is_empty() && !kind.is_empty() => {
                Some(Self::new(*group, *kind, *ns, *name))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// An identity plus the API version it was applied with; enough to address the live object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: ResourceId,
    pub version: String,
}

impl ObjectRef {
    pub fn new(id: ResourceId, version: impl Into<String>) -> Self { Self { id, version: version.into() } }

    pub fn api_version(&self) -> String {
        if self.id.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.id.group, self.version)
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.id.fmt(f) }
}

impl Identified for ObjectRef {
    fn id(&self) -> ResourceId { self.id.clone() }
}

impl Identified for ResourceId {
    fn id(&self) -> ResourceId { self.clone() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Configured,
    Unchanged,
    Deleted,
    /// Left in place, e.g. excluded from pruning or already gone.
    Skipped,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Created => "created",
            Action::Configured => "configured",
            Action::Unchanged => "unchanged",
            Action::Deleted => "deleted",
            Action::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Outcome of applying or deleting a single object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub object: ResourceId,
    pub action: Action,
}

impl Change {
    pub fn new(object: ResourceId, action: Action) -> Self { Self { object, action } }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{} {}", self.object, self.action) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub entries: Vec<Change>,
}

impl ChangeSet {
    pub fn push(&mut self, change: Change) { self.entries.push(change); }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &Change> { self.entries.iter() }

    pub fn count(&self, action: Action) -> usize {
        self.entries.iter().filter(|c| c.action == action).count()
    }
}

impl Extend<Change> for ChangeSet {
    fn extend<T: IntoIterator<Item = Change>>(&mut self, iter: T) { self.entries.extend(iter); }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Recreate objects whose update is rejected for immutable field changes.
    pub force: bool,
    /// Upper bound for the delete-and-wait step of a forced recreation.
    pub timeout: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self { Self { force: false, timeout: Duration::from_secs(60) } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Propagation {
    #[default]
    Background,
    Foreground,
    Orphan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteOptions {
    pub propagation: Propagation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self { Self { timeout: Duration::from_secs(60), interval: Duration::from_secs(2) } }
}
