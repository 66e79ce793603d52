use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kustodian_core::{Error, Result};

use crate::{codec, Inventory, InventoryStore};

/// In-memory store for tests and dry runs. Records are kept in their encoded form
/// so loads go through the same decoder as the cluster store.
pub struct MemoryInventoryStore {
    records: Mutex<BTreeMap<(String, String), String>>,
    /// `None` means every namespace exists.
    namespaces: Option<Mutex<BTreeSet<String>>>,
    create_namespace: bool,
    saves: Mutex<usize>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MemoryInventoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryInventoryStore {
    pub fn new() -> Self {
        Self { records: Mutex::new(BTreeMap::new()), namespaces: None, create_namespace: false, saves: Mutex::new(0) }
    }

    /// Only `namespaces` exist; saving elsewhere fails unless `create_namespace` is set.
    pub fn with_namespaces<'a>(namespaces: impl IntoIterator<Item = &'a str>, create_namespace: bool) -> Self {
        let set = namespaces.into_iter().map(str::to_string).collect();
        Self { namespaces: Some(Mutex::new(set)), create_namespace, ..Self::new() }
    }

    /// Stores a raw document, bypassing the encoder.
    pub fn put_raw(&self, name: &str, namespace: &str, doc: impl Into<String>) {
        lock(&self.records).insert((namespace.to_string(), name.to_string()), doc.into());
    }

    pub fn raw(&self, name: &str, namespace: &str) -> Option<String> {
        lock(&self.records).get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn save_count(&self) -> usize { *lock(&self.saves) }
}

#[async_trait]
impl InventoryStore for MemoryInventoryStore {
    async fn load(&self, name: &str, namespace: &str) -> Result<Option<Inventory>> {
        match self.raw(name, namespace) {
            Some(doc) => codec::decode(name, namespace, &doc).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, inventory: &Inventory) -> Result<()> {
        if let Some(namespaces) = &self.namespaces {
            let mut namespaces = lock(namespaces);
            if !namespaces.contains(&inventory.namespace) {
                if !self.create_namespace {
                    return Err(Error::Storage(format!("namespace {} not found", inventory.namespace)));
                }
                namespaces.insert(inventory.namespace.clone());
            }
        }
        let doc = codec::encode(inventory)?;
        self.put_raw(&inventory.name, &inventory.namespace, doc);
        *lock(&self.saves) += 1;
        Ok(())
    }

    async fn delete(&self, inventory: &Inventory) -> Result<()> {
        lock(&self.records).remove(&(inventory.namespace.clone(), inventory.name.clone()));
        Ok(())
    }
}
