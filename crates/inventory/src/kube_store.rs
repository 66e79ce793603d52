use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::ObjectMeta,
    Client,
};
use kustodian_core::{Error, Result};
use kustodian_kubehub::is_not_found;
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::{codec, Inventory, InventoryStore};

/// Stores each inventory as a ConfigMap named after it, in its own namespace.
pub struct KubeInventoryStore {
    client: Client,
    field_manager: String,
    create_namespace: bool,
}

impl KubeInventoryStore {
    pub fn new(client: Client) -> Self {
        Self { client, field_manager: "kustodian".to_string(), create_namespace: false }
    }

    /// Create the inventory namespace on save when it does not exist yet.
    pub fn with_create_namespace(mut self, on: bool) -> Self {
        self.create_namespace = on;
        self
    }

    pub fn with_field_manager(mut self, name: impl Into<String>) -> Self {
        self.field_manager = name.into();
        self
    }

    /// Reads cluster-scoped Namespaces, so only runs with `create_namespace` set.
    async fn ensure_namespace(&self, namespace: &str) -> anyhow::Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(namespace).await.with_context(|| format!("reading Namespace {}", namespace))?.is_some() {
            return Ok(());
        }
        let ns = Namespace {
            metadata: ObjectMeta { name: Some(namespace.to_string()), ..Default::default() },
            ..Default::default()
        };
        let pp = PatchParams::apply(&self.field_manager).force();
        api.patch(namespace, &pp, &Patch::Apply(&ns))
            .await
            .with_context(|| format!("creating Namespace {}", namespace))?;
        info!(namespace, "inventory namespace created");
        Ok(())
    }
}

/// A 404 on the ConfigMap apply means its namespace does not exist.
fn save_error(inventory: &Inventory, err: kube::Error) -> Error {
    if is_not_found(&err) {
        return Error::Storage(format!("namespace {} not found", inventory.namespace));
    }
    Error::storage(anyhow::Error::new(err).context(format!("applying ConfigMap {}", inventory.key())))
}

#[async_trait]
impl InventoryStore for KubeInventoryStore {
    async fn load(&self, name: &str, namespace: &str) -> Result<Option<Inventory>> {
        let started = Instant::now();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = api
            .get_opt(name)
            .await
            .with_context(|| format!("reading ConfigMap {}/{}", namespace, name))
            .map_err(Error::storage)?;
        histogram!("inventory_load_ms", started.elapsed().as_secs_f64() * 1000.0);
        match cm {
            Some(cm) => {
                let inv = codec::from_config_map(&cm)?;
                debug!(inventory = %inv.key(), entries = inv.len(), "inventory loaded");
                Ok(Some(inv))
            }
            None => {
                debug!(name, namespace, "no inventory stored yet");
                Ok(None)
            }
        }
    }

    async fn save(&self, inventory: &Inventory) -> Result<()> {
        let started = Instant::now();
        if self.create_namespace {
            self.ensure_namespace(&inventory.namespace).await.map_err(Error::storage)?;
        }
        let cm = codec::to_config_map(inventory)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &inventory.namespace);
        let pp = PatchParams::apply(&self.field_manager).force();
        api.patch(&inventory.name, &pp, &Patch::Apply(&cm)).await.map_err(|e| save_error(inventory, e))?;
        histogram!("inventory_save_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("inventory_save_total", 1u64);
        Ok(())
    }

    async fn delete(&self, inventory: &Inventory) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &inventory.namespace);
        match api.delete(&inventory.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::storage(
                anyhow::Error::new(e).context(format!("deleting ConfigMap {}", inventory.key())),
            )),
        }
    }
}
