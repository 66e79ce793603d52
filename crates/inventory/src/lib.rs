//! Kustodian inventory: the record of which objects a named inventory owns,
//! its ConfigMap encoding, and the stores that persist it.
//!
//! A record is built fresh from the rendered objects on every apply, read back
//! from the cluster to obtain the previous record, and replaced wholesale once
//! all stages have been applied. The stale set is what the previous record owned
//! that the current one no longer does.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use kustodian_core::{Identified, ObjectRef, Resource, ResourceId, Result};

pub mod codec;
mod kube_store;
mod memory;

pub use kube_store::KubeInventoryStore;
pub use memory::MemoryInventoryStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    pub name: String,
    pub namespace: String,
    /// URL of the sources the objects were rendered from.
    pub source: Option<String>,
    pub revision: Option<String>,
    /// One digest per content-addressed input, in input order.
    pub digests: Vec<String>,
    /// Identity -> API version the object was applied with.
    entries: BTreeMap<ResourceId, String>,
}

impl Inventory {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            source: None,
            revision: None,
            digests: Vec::new(),
            entries: BTreeMap::new(),
        }
    }

    pub fn set_source(&mut self, source: Option<String>, revision: Option<String>, digests: Vec<String>) {
        self.source = source.filter(|s| !s.is_empty());
        self.revision = revision.filter(|s| !s.is_empty());
        self.digests = digests;
    }

    pub fn add_objects<'a>(&mut self, objects: impl IntoIterator<Item = &'a Resource>) {
        for obj in objects {
            self.entries.insert(obj.id(), obj.version().to_string());
        }
    }

    /// Returns false when the identity was already present (the version is updated).
    pub fn insert(&mut self, obj: ObjectRef) -> bool {
        self.entries.insert(obj.id, obj.version).is_none()
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn contains(&self, id: &ResourceId) -> bool { self.entries.contains_key(id) }

    pub fn ids(&self) -> BTreeSet<ResourceId> { self.entries.keys().cloned().collect() }

    pub fn objects(&self) -> Vec<ObjectRef> {
        self.entries.iter().map(|(id, v)| ObjectRef::new(id.clone(), v.clone())).collect()
    }

    /// `(name, namespace)` display form used in logs and errors.
    pub fn key(&self) -> String { format!("{}/{}", self.namespace, self.name) }
}

/// Objects owned by `previous` but absent from `current`, addressed with the
/// version they were last applied with. Pure; the first run has no previous record.
pub fn compute_stale_set(previous: Option<&Inventory>, current: &Inventory) -> Vec<ObjectRef> {
    let Some(previous) = previous else { return Vec::new() };
    previous
        .entries
        .iter()
        .filter(|(id, _)| !current.contains(id))
        .map(|(id, v)| ObjectRef::new(id.clone(), v.clone()))
        .collect()
}

/// Persistence for inventory records. Stores never retry; a record that cannot be
/// decoded is reported as corrupt rather than treated as empty.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// `Ok(None)` when no record exists yet for `name` in `namespace`.
    async fn load(&self, name: &str, namespace: &str) -> Result<Option<Inventory>>;
    /// Overwrites any record with the same name and namespace.
    async fn save(&self, inventory: &Inventory) -> Result<()>;
    async fn delete(&self, inventory: &Inventory) -> Result<()>;
}

#[async_trait]
impl<T: InventoryStore + ?Sized> InventoryStore for Arc<T> {
    async fn load(&self, name: &str, namespace: &str) -> Result<Option<Inventory>> {
        (**self).load(name, namespace).await
    }
    async fn save(&self, inventory: &Inventory) -> Result<()> { (**self).save(inventory).await }
    async fn delete(&self, inventory: &Inventory) -> Result<()> { (**self).delete(inventory).await }
}
