use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::DynamicObject,
    Client,
};
use kustodian_core::{
    Action, ApplyOptions, Change, DeleteFailure, DeleteOptions, Error, Identified, ObjectRef, Propagation, Resource,
    ResourceId, Result, WaitOptions, PRUNE_ANNOTATION, PRUNE_DISABLED,
};
use kustodian_kubehub::{is_immutable, is_not_found, ApiResolver};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::readiness::{evaluate, Readiness};
use crate::ApplyEngine;

/// Server-side apply against the live cluster.
pub struct KubeEngine {
    resolver: ApiResolver,
    field_manager: String,
}

fn delete_params(propagation: Propagation) -> DeleteParams {
    match propagation {
        Propagation::Background => DeleteParams::background(),
        Propagation::Foreground => DeleteParams::foreground(),
        Propagation::Orphan => DeleteParams::orphan(),
    }
}

fn delete_failure(id: &ResourceId, e: anyhow::Error) -> Error {
    counter!("delete_err", 1u64);
    Error::Delete(vec![DeleteFailure { object: id.clone(), message: format!("{:#}", e) }])
}

/// Deleting and re-applying only helps when the rejection is about an immutable field;
/// any other invalid object would be deleted and then rejected again.
fn should_recreate(force: bool, err: &kube::Error) -> bool { force && is_immutable(err) }

fn pending_list(objects: &[ObjectRef]) -> String {
    objects.iter().map(|o| o.to_string()).collect::<Vec<_>>().join(", ")
}

impl KubeEngine {
    pub fn new(client: Client) -> Self {
        Self { resolver: ApiResolver::new(client), field_manager: "kustodian".to_string() }
    }

    pub fn with_field_manager(mut self, name: impl Into<String>) -> Self {
        self.field_manager = name.into();
        self
    }

    /// Applies and classifies the outcome by comparing resource versions.
    async fn server_side_apply(
        &self,
        api: &Api<DynamicObject>,
        obj: &Resource,
    ) -> std::result::Result<Action, kube::Error> {
        let name = obj.name();
        let before = api.get_opt(name).await?;
        let pp = PatchParams::apply(&self.field_manager).force();
        let after = api.patch(name, &pp, &Patch::Apply(obj.raw())).await?;
        Ok(match before {
            None => Action::Created,
            Some(b) if b.metadata.resource_version == after.metadata.resource_version => Action::Unchanged,
            Some(_) => Action::Configured,
        })
    }

    /// Deletes the live object, waits for it to disappear, and applies again.
    async fn recreate(&self, api: &Api<DynamicObject>, obj: &Resource, timeout: Duration) -> anyhow::Result<Action> {
        let name = obj.name();
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(anyhow::Error::new(e).context("deleting for recreation")),
        }
        let deadline = Instant::now() + timeout;
        while api.get_opt(name).await.context("polling for removal")?.is_some() {
            if Instant::now() >= deadline {
                return Err(anyhow!("still present after {:?}", timeout));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        self.server_side_apply(api, obj).await.context("re-applying after recreation")?;
        counter!("apply_recreated_total", 1u64);
        Ok(Action::Created)
    }

    /// `None` when the object does not exist or its kind is not served.
    async fn live(&self, obj: &ObjectRef) -> anyhow::Result<Option<DynamicObject>> {
        let Some(api) = self.resolver.try_api_for(obj).await? else { return Ok(None) };
        api.get_opt(&obj.id.name).await.with_context(|| format!("reading {}", obj))
    }
}

#[async_trait]
impl ApplyEngine for KubeEngine {
    async fn apply(&self, obj: &Resource, opts: ApplyOptions) -> Result<Change> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let id = obj.id();
        let api = self.resolver.api_for(&obj.object_ref()).await.map_err(|e| {
            counter!("apply_err", 1u64);
            Error::apply(&id, format!("{:#}", e))
        })?;
        let action = match self.server_side_apply(&api, obj).await {
            Ok(action) => action,
            Err(e) if should_recreate(opts.force, &e) => {
                warn!(object = %id, error = %e, "immutable field change; recreating");
                self.recreate(&api, obj, opts.timeout).await.map_err(|e| {
                    counter!("apply_err", 1u64);
                    Error::apply(&id, format!("{:#}", e))
                })?
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                return Err(Error::apply(&id, e));
            }
        };
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_ok", 1u64);
        debug!(object = %id, %action, "applied");
        Ok(Change::new(id, action))
    }

    async fn delete(&self, obj: &ObjectRef, opts: DeleteOptions) -> Result<Change> {
        let id = obj.id();
        let Some(api) = self.resolver.try_api_for(obj).await.map_err(|e| delete_failure(&id, e))? else {
            debug!(object = %id, "kind no longer served");
            return Ok(Change::new(id, Action::Skipped));
        };
        let live = api
            .get_opt(&id.name)
            .await
            .context("reading live object")
            .map_err(|e| delete_failure(&id, e))?;
        let Some(live) = live else {
            debug!(object = %id, "already gone");
            return Ok(Change::new(id, Action::Skipped));
        };
        let excluded = live.metadata.annotations.as_ref().and_then(|a| a.get(PRUNE_ANNOTATION)).map(String::as_str)
            == Some(PRUNE_DISABLED);
        if excluded {
            info!(object = %id, "deletion disabled by annotation");
            return Ok(Change::new(id, Action::Skipped));
        }
        match api.delete(&id.name, &delete_params(opts.propagation)).await {
            Ok(_) => {
                counter!("delete_ok", 1u64);
                Ok(Change::new(id, Action::Deleted))
            }
            Err(e) if is_not_found(&e) => Ok(Change::new(id, Action::Skipped)),
            Err(e) => Err(delete_failure(&id, anyhow::Error::new(e))),
        }
    }

    async fn wait(&self, objects: &[ObjectRef], opts: WaitOptions) -> Result<()> {
        let deadline = Instant::now() + opts.timeout;
        let mut pending: Vec<ObjectRef> = objects.to_vec();
        loop {
            let mut still = Vec::new();
            for obj in pending {
                let live = self.live(&obj).await.map_err(|e| Error::Wait(format!("{}: {:#}", obj, e)))?;
                let state = match live {
                    None => Readiness::InProgress("not found".into()),
                    Some(live) => {
                        let json = serde_json::to_value(&live).map_err(|e| Error::Wait(format!("{}: {}", obj, e)))?;
                        evaluate(&obj.id, &json)
                    }
                };
                match state {
                    Readiness::Ready => {}
                    Readiness::InProgress(reason) => {
                        debug!(object = %obj, %reason, "not ready");
                        still.push(obj);
                    }
                    Readiness::Failed(reason) => return Err(Error::Wait(format!("{} failed: {}", obj, reason))),
                }
            }
            if still.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Wait(format!(
                    "not ready after {:?}: {}",
                    opts.timeout,
                    pending_list(&still)
                )));
            }
            pending = still;
            tokio::time::sleep(opts.interval).await;
        }
    }

    async fn wait_for_termination(&self, objects: &[ObjectRef], opts: WaitOptions) -> Result<()> {
        let deadline = Instant::now() + opts.timeout;
        let mut pending: Vec<ObjectRef> = objects.to_vec();
        loop {
            let mut still = Vec::new();
            for obj in pending {
                match self.live(&obj).await {
                    Ok(None) => {}
                    Ok(Some(_)) => still.push(obj),
                    Err(e) => return Err(Error::Wait(format!("{}: {:#}", obj, e))),
                }
            }
            if still.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Wait(format!(
                    "not terminated after {:?}: {}",
                    opts.timeout,
                    pending_list(&still)
                )));
            }
            pending = still;
            tokio::time::sleep(opts.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_objects_are_listed_in_order() {
        let objs = vec![
            ObjectRef::new(ResourceId::new("apps", "Deployment", "a", "web"), "v1"),
            ObjectRef::new(ResourceId::new("", "Namespace", "", "a"), "v1"),
        ];
        assert_eq!(pending_list(&objs), "Deployment/a/web, Namespace/a");
    }

    fn unprocessable(message: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: message.into(),
            reason: "Invalid".into(),
            code: 422,
        })
    }

    #[test]
    fn force_recreates_only_on_immutable_field_changes() {
        let immutable = unprocessable(r#"Job.batch "migrate" is invalid: spec.template: Invalid value: ...: field is immutable"#);
        let invalid = unprocessable(r#"Service "web" is invalid: spec.ports[0].port: Invalid value: 0: must be between 1 and 65535"#);
        assert!(should_recreate(true, &immutable));
        assert!(!should_recreate(false, &immutable));
        assert!(!should_recreate(true, &invalid));
    }

    #[test]
    fn propagation_maps_to_delete_params() {
        use kube::api::PropagationPolicy;
        assert!(matches!(delete_params(Propagation::Foreground).propagation_policy, Some(PropagationPolicy::Foreground)));
        assert!(matches!(delete_params(Propagation::Orphan).propagation_policy, Some(PropagationPolicy::Orphan)));
        assert!(matches!(delete_params(Propagation::default()).propagation_policy, Some(PropagationPolicy::Background)));
    }
}
