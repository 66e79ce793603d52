//! Kustodian reconcile: drives one apply or delete run for a named inventory.
//!
//! An apply run resolves autoscaler conflicts, plans stages, applies and waits
//! for stage one, applies stage two object by object, persists the new inventory
//! and only then prunes what the previous inventory owned and this one does not.
//! Every run rehydrates from the stored record; nothing is kept between runs.

#![forbid(unsafe_code)]

use kustodian_apply::ApplyEngine;
use kustodian_core::{
    Action, Change, ChangeSet, DeleteFailure, DeleteOptions, Error, Identified, ObjectRef, Resource, Result,
    WaitOptions,
};
use kustodian_inventory::{compute_stale_set, Inventory, InventoryStore};
use kustodian_plan::{cede_replicas, plan, teardown_order};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info, warn};

mod config;
mod report;

pub use config::{ReconcileConfig, MAX_TIMEOUT};
pub use report::{LogReporter, Reporter};

/// Outcome of a successful apply run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// One entry per candidate object, in plan order.
    pub applied: ChangeSet,
    pub pruned: ChangeSet,
    /// Objects the previous record owned that this run no longer declares.
    pub stale: Vec<ObjectRef>,
    pub inventory: Inventory,
}

#[derive(Debug, Clone)]
pub struct DeleteReport {
    pub deleted: ChangeSet,
    pub inventory: Inventory,
}

pub struct Reconciler<E, S> {
    engine: E,
    store: S,
    config: ReconcileConfig,
    reporter: Box<dyn Reporter>,
}

impl<E: ApplyEngine, S: InventoryStore> Reconciler<E, S> {
    pub fn new(engine: E, store: S, config: ReconcileConfig) -> Self {
        Self { engine, store, config, reporter: Box::new(LogReporter) }
    }

    pub fn with_reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn config(&self) -> &ReconcileConfig { &self.config }

    /// Waits get whatever is left of the run budget, less one poll so that a wait
    /// timeout (which names the pending objects) fires before the run-level one.
    fn wait_options(&self, deadline: Instant) -> WaitOptions {
        let interval = self.config.poll_interval;
        let left = deadline.saturating_duration_since(Instant::now());
        WaitOptions { timeout: left.saturating_sub(interval).max(interval), interval }
    }

    async fn bounded<T>(&self, run: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.timeout, run).await {
            Ok(res) => res,
            Err(_) => {
                counter!("reconcile_timeout_total", 1u64);
                Err(Error::Timeout(self.config.timeout))
            }
        }
    }

    /// Reconciles `objects` against the cluster. `digests` identify the inputs the
    /// objects were rendered from and are recorded on the inventory.
    pub async fn apply(&self, objects: Vec<Resource>, digests: Vec<String>) -> Result<RunReport> {
        self.config.validate()?;
        let started = std::time::Instant::now();
        let deadline = Instant::now() + self.config.timeout;
        let res = self.bounded(self.apply_run(objects, digests, deadline)).await;
        histogram!("reconcile_apply_ms", started.elapsed().as_secs_f64() * 1000.0);
        if res.is_ok() {
            counter!("reconcile_apply_ok", 1u64);
        } else {
            counter!("reconcile_apply_err", 1u64);
        }
        res
    }

    async fn apply_run(&self, mut objects: Vec<Resource>, digests: Vec<String>, deadline: Instant) -> Result<RunReport> {
        let cfg = &self.config;
        for id in cede_replicas(&mut objects) {
            debug!(object = %id, "replica count ceded");
        }
        for obj in objects.iter_mut() {
            obj.set_owner_labels(&cfg.name, &cfg.namespace);
        }
        let mut current = Inventory::new(&cfg.name, &cfg.namespace);
        current.set_source(cfg.source.clone(), cfg.revision.clone(), digests);
        let plan = plan(objects)?;
        current.add_objects(plan.iter());

        let previous = self.store.load(&cfg.name, &cfg.namespace).await?;
        info!(
            inventory = %current.key(),
            objects = plan.len(),
            foundational = plan.foundational.len(),
            previous = previous.as_ref().map(Inventory::len).unwrap_or(0),
            "apply run starting"
        );

        let opts = cfg.apply_options();
        let mut applied = ChangeSet::default();
        if !plan.foundational.is_empty() {
            for obj in &plan.foundational {
                let change = self.engine.apply(obj, opts).await?;
                self.reporter.change(&change);
                applied.push(change);
            }
            let refs: Vec<ObjectRef> = plan.foundational.iter().map(Resource::object_ref).collect();
            self.reporter.progress(&format!("waiting for {} foundational object(s)", refs.len()));
            self.engine.wait(&refs, self.wait_options(deadline)).await?;
        }
        for obj in &plan.dependent {
            let change = self.engine.apply(obj, opts).await?;
            self.reporter.change(&change);
            applied.push(change);
        }

        let stale = compute_stale_set(previous.as_ref(), &current);
        self.store.save(&current).await.map_err(|e| match e {
            Error::Storage(msg) => Error::Persist(msg),
            other => Error::Persist(other.to_string()),
        })?;
        self.reporter.progress(&format!("inventory {} saved with {} object(s)", current.key(), current.len()));

        let mut pruned = ChangeSet::default();
        if cfg.prune && !stale.is_empty() {
            let failures = self.delete_each(teardown_order(stale.clone()), &mut pruned).await;
            counter!("prune_deleted_total", pruned.count(Action::Deleted) as u64);
            if !failures.is_empty() {
                return Err(Error::Delete(failures));
            }
        } else if !stale.is_empty() {
            info!(inventory = %current.key(), stale = stale.len(), "pruning disabled; stale objects left in place");
        }

        if cfg.wait {
            let refs: Vec<ObjectRef> = plan.iter().map(Resource::object_ref).collect();
            self.reporter.progress(&format!("waiting for {} object(s) to become ready", refs.len()));
            self.engine.wait(&refs, self.wait_options(deadline)).await?;
            let deleted = deleted_refs(&pruned, &stale);
            if !deleted.is_empty() {
                self.reporter.progress(&format!("waiting for {} object(s) to terminate", deleted.len()));
                self.engine.wait_for_termination(&deleted, self.wait_options(deadline)).await?;
            }
        }

        info!(
            inventory = %current.key(),
            applied = applied.len(),
            pruned = pruned.count(Action::Deleted),
            "apply run finished"
        );
        Ok(RunReport { applied, pruned, stale, inventory: current })
    }

    /// Deletes every object the stored inventory owns, then the record itself.
    /// The record is kept when any object could not be deleted, so the run can be repeated.
    pub async fn delete(&self) -> Result<DeleteReport> {
        self.config.validate()?;
        let deadline = Instant::now() + self.config.timeout;
        self.bounded(self.delete_run(deadline)).await
    }

    async fn delete_run(&self, deadline: Instant) -> Result<DeleteReport> {
        let cfg = &self.config;
        let inventory = self
            .store
            .load(&cfg.name, &cfg.namespace)
            .await?
            .ok_or_else(|| Error::InventoryNotFound(format!("{}/{}", cfg.namespace, cfg.name)))?;
        info!(inventory = %inventory.key(), objects = inventory.len(), "delete run starting");

        let owned = inventory.objects();
        let mut deleted = ChangeSet::default();
        let failures = self.delete_each(teardown_order(owned.clone()), &mut deleted).await;
        if !failures.is_empty() {
            warn!(inventory = %inventory.key(), failed = failures.len(), "inventory kept; some objects were not deleted");
            return Err(Error::Delete(failures));
        }
        self.store.delete(&inventory).await?;
        self.reporter.progress(&format!("inventory {} deleted", inventory.key()));

        if cfg.wait {
            let gone = deleted_refs(&deleted, &owned);
            if !gone.is_empty() {
                self.reporter.progress(&format!("waiting for {} object(s) to terminate", gone.len()));
                self.engine.wait_for_termination(&gone, self.wait_options(deadline)).await?;
            }
        }
        Ok(DeleteReport { deleted, inventory })
    }

    /// Deletes in the given order, reporting each change and collecting failures
    /// without stopping.
    async fn delete_each(&self, objects: Vec<ObjectRef>, out: &mut ChangeSet) -> Vec<DeleteFailure> {
        let mut failures = Vec::new();
        for obj in objects {
            match self.engine.delete(&obj, DeleteOptions::default()).await {
                Ok(change) => {
                    self.reporter.change(&change);
                    out.push(change);
                }
                Err(Error::Delete(fs)) => {
                    for f in &fs {
                        warn!(object = %f.object, error = %f.message, "delete failed");
                    }
                    failures.extend(fs);
                }
                Err(e) => {
                    warn!(object = %obj, error = %e, "delete failed");
                    failures.push(DeleteFailure { object: obj.id(), message: e.to_string() });
                }
            }
        }
        failures
    }
}

/// The refs among `candidates` whose change was an actual deletion.
fn deleted_refs(changes: &ChangeSet, candidates: &[ObjectRef]) -> Vec<ObjectRef> {
    candidates
        .iter()
        .filter(|c| changes.iter().any(|ch: &Change| ch.action == Action::Deleted && ch.object == c.id))
        .cloned()
        .collect()
}
