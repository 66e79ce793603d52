//! Kustodian kubehub – shared kube client and API discovery

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use kustodian_core::ObjectRef;
use once_cell::sync::Lazy;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

static CLIENT: Lazy<OnceCell<Client>> = Lazy::new(OnceCell::new);

/// Process-wide client built from the default kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client") })
        .await?;
    Ok(client.clone())
}

pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

pub fn gvk_of(obj: &ObjectRef) -> GroupVersionKind {
    GroupVersionKind { group: obj.id.group.clone(), version: obj.version.clone(), kind: obj.id.kind.clone() }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

const IMMUTABLE_MESSAGES: &[&str] = &[
    "field is immutable",
    "cannot change roleRef",
    "updates to statefulset spec for fields other than",
];

/// Rejected because the update touches a field that can only be set on creation.
/// Only these are fixed by deleting and recreating the object.
pub fn is_immutable(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) if ae.code == 422 => IMMUTABLE_MESSAGES.iter().any(|m| ae.message.contains(m)),
        _ => false,
    }
}

/// How long a kind the server did not serve is remembered as absent.
const ABSENT_TTL: Duration = Duration::from_secs(10);

enum Cached {
    Hit((ApiResource, bool)),
    Absent,
    Unknown,
}

/// Discovery results plus recently missed kinds, keyed by [`gvk_key`].
#[derive(Default)]
struct DiscoveryCache {
    found: HashMap<String, (ApiResource, bool)>,
    absent: HashMap<String, Instant>,
}

impl DiscoveryCache {
    fn get(&self, key: &str, now: Instant) -> Cached {
        if let Some(hit) = self.found.get(key) {
            return Cached::Hit(hit.clone());
        }
        match self.absent.get(key) {
            Some(at) if now.saturating_duration_since(*at) < ABSENT_TTL => Cached::Absent,
            _ => Cached::Unknown,
        }
    }

    fn replace(&mut self, found: HashMap<String, (ApiResource, bool)>) {
        self.absent.retain(|k, _| !found.contains_key(k));
        self.found = found;
    }

    fn mark_absent(&mut self, key: &str, now: Instant) {
        self.absent.insert(key.to_string(), now);
    }
}

/// Resolves GVKs to API resources. Discovery results are cached per resolver and
/// re-run on a miss, so kinds registered by CRDs applied earlier in a run become
/// addressable without a new process. A kind still missing after a refresh is not
/// looked up again for a short while.
pub struct ApiResolver {
    client: Client,
    cache: Mutex<DiscoveryCache>,
}

impl ApiResolver {
    pub fn new(client: Client) -> Self {
        Self { client, cache: Mutex::new(DiscoveryCache::default()) }
    }

    pub fn client(&self) -> &Client { &self.client }

    /// Returns the API resource and whether it is namespaced.
    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        self.lookup(gvk).await?.ok_or_else(|| anyhow!("GVK not found: {}", gvk_key(gvk)))
    }

    /// Like [`ApiResolver::resolve`], but a kind the server does not serve is `None`.
    pub async fn lookup(&self, gvk: &GroupVersionKind) -> Result<Option<(ApiResource, bool)>> {
        let key = gvk_key(gvk);
        let mut cache = self.cache.lock().await;
        match cache.get(&key, Instant::now()) {
            Cached::Hit(hit) => return Ok(Some(hit)),
            Cached::Absent => return Ok(None),
            Cached::Unknown => {}
        }
        debug!(gvk = %key, "discovery cache miss; refreshing");
        let discovery = Discovery::new(self.client.clone()).run().await.context("running API discovery")?;
        let mut found = HashMap::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    let k = gvk_key(&GroupVersionKind {
                        group: ar.group.clone(),
                        version: ar.version.clone(),
                        kind: ar.kind.clone(),
                    });
                    found.insert(k, (ar, namespaced));
                }
            }
        }
        info!(resources = found.len(), "API discovery refreshed");
        cache.replace(found);
        match cache.get(&key, Instant::now()) {
            Cached::Hit(hit) => Ok(Some(hit)),
            _ => {
                cache.mark_absent(&key, Instant::now());
                Ok(None)
            }
        }
    }

    fn scoped(&self, obj: &ObjectRef, ar: &ApiResource, namespaced: bool) -> Result<Api<DynamicObject>> {
        if namespaced {
            if obj.id.namespace.is_empty() {
                return Err(anyhow!("namespace required for namespaced kind {}", obj.id.kind));
            }
            Ok(Api::namespaced_with(self.client.clone(), &obj.id.namespace, ar))
        } else {
            Ok(Api::all_with(self.client.clone(), ar))
        }
    }

    /// Dynamic API handle scoped to the object's namespace when the kind is namespaced.
    pub async fn api_for(&self, obj: &ObjectRef) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(&gvk_of(obj)).await?;
        self.scoped(obj, &ar, namespaced)
    }

    /// `None` when the object's kind is not served, e.g. after its CRD was removed.
    pub async fn try_api_for(&self, obj: &ObjectRef) -> Result<Option<Api<DynamicObject>>> {
        match self.lookup(&gvk_of(obj)).await? {
            Some((ar, namespaced)) => self.scoped(obj, &ar, namespaced).map(Some),
            None => Ok(None),
        }
    }
}
