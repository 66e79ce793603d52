//! ConfigMap encoding of an [`Inventory`].
//!
//! The record lives in `data.inventory` as a JSON document with entries sorted by
//! identity, so re-saving the same logical content produces identical bytes.
//! Source and revision are mirrored into annotations for `kubectl` users only;
//! decoding reads the data key exclusively.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;
use kustodian_core::{Error, ObjectRef, ResourceId, Result};
use serde::{Deserialize, Serialize};

use crate::Inventory;

pub const DATA_KEY: &str = "inventory";
pub const SOURCE_ANNOTATION: &str = "kustodian.dev/source";
pub const REVISION_ANNOTATION: &str = "kustodian.dev/revision";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "kustodian";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDoc {
    pub id: String,
    pub v: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDoc {
    pub entries: Vec<EntryDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default)]
    pub digests: Vec<String>,
}

impl From<&Inventory> for InventoryDoc {
    fn from(inv: &Inventory) -> Self {
        Self {
            entries: inv
                .entries
                .iter()
                .map(|(id, v)| EntryDoc { id: id.encode(), v: v.clone() })
                .collect(),
            source: inv.source.clone(),
            revision: inv.revision.clone(),
            digests: inv.digests.clone(),
        }
    }
}

pub fn encode(inv: &Inventory) -> Result<String> {
    serde_json::to_string(&InventoryDoc::from(inv))
        .map_err(|e| Error::Persist(format!("encoding inventory {}: {}", inv.key(), e)))
}

pub fn decode(name: &str, namespace: &str, doc: &str) -> Result<Inventory> {
    let key = format!("{}/{}", namespace, name);
    let doc: InventoryDoc = serde_json::from_str(doc).map_err(|e| Error::corrupt(&key, e.to_string()))?;
    let mut inv = Inventory::new(name, namespace);
    let mut seen = BTreeSet::new();
    for entry in doc.entries {
        let id = ResourceId::decode(&entry.id)
            .ok_or_else(|| Error::corrupt(&key, format!("malformed entry id {:?}", entry.id)))?;
        if entry.v.is_empty() {
            return Err(Error::corrupt(&key, format!("entry {:?} has no version", entry.id)));
        }
        if !seen.insert(id.clone()) {
            return Err(Error::corrupt(&key, format!("duplicate entry {:?}", entry.id)));
        }
        inv.insert(ObjectRef::new(id, entry.v));
    }
    inv.source = doc.source;
    inv.revision = doc.revision;
    inv.digests = doc.digests;
    Ok(inv)
}

pub fn to_config_map(inv: &Inventory) -> Result<ConfigMap> {
    let mut annotations = BTreeMap::new();
    if let Some(source) = &inv.source {
        annotations.insert(SOURCE_ANNOTATION.to_string(), source.clone());
    }
    if let Some(revision) = &inv.revision {
        annotations.insert(REVISION_ANNOTATION.to_string(), revision.clone());
    }
    let labels = BTreeMap::from([
        (COMPONENT_LABEL.to_string(), "inventory".to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ]);
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(inv.name.clone()),
            namespace: Some(inv.namespace.clone()),
            labels: Some(labels),
            annotations: if annotations.is_empty() { None } else { Some(annotations) },
            ..Default::default()
        },
        data: Some(BTreeMap::from([(DATA_KEY.to_string(), encode(inv)?)])),
        ..Default::default()
    })
}

pub fn from_config_map(cm: &ConfigMap) -> Result<Inventory> {
    let name = cm.metadata.name.as_deref().unwrap_or_default();
    let namespace = cm.metadata.namespace.as_deref().unwrap_or_default();
    let doc = cm
        .data
        .as_ref()
        .and_then(|d| d.get(DATA_KEY))
        .ok_or_else(|| Error::corrupt(format!("{}/{}", namespace, name), format!("missing data.{}", DATA_KEY)))?;
    decode(name, namespace, doc)
}
