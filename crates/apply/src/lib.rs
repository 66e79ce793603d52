//! Kustodian apply: the engine that submits, deletes and watches objects.
//!
//! [`ApplyEngine`] is the seam between the reconciler and the cluster. The kube
//! implementation uses server-side apply; tests substitute an in-memory fake.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use kustodian_core::{
    ApplyOptions, Change, ChangeSet, DeleteFailure, DeleteOptions, Error, Identified, ObjectRef, Resource, Result,
    WaitOptions,
};

mod engine;
pub mod manifest;
pub mod readiness;

pub use engine::KubeEngine;

#[async_trait]
pub trait ApplyEngine: Send + Sync {
    async fn apply(&self, object: &Resource, opts: ApplyOptions) -> Result<Change>;

    /// Applies in the given order and stops at the first failure.
    async fn apply_all(&self, objects: &[Resource], opts: ApplyOptions) -> Result<ChangeSet> {
        let mut set = ChangeSet::default();
        for obj in objects {
            set.push(self.apply(obj, opts).await?);
        }
        Ok(set)
    }

    /// Deleting an object that is already gone is not an error.
    async fn delete(&self, object: &ObjectRef, opts: DeleteOptions) -> Result<Change>;

    /// Deletes in the given order, continuing past failures; any failure fails the
    /// whole call with every failing object listed.
    async fn delete_all(&self, objects: &[ObjectRef], opts: DeleteOptions) -> Result<ChangeSet> {
        let mut set = ChangeSet::default();
        let mut failures = Vec::new();
        for obj in objects {
            match self.delete(obj, opts).await {
                Ok(change) => set.push(change),
                Err(Error::Delete(fs)) => failures.extend(fs),
                Err(e) => failures.push(DeleteFailure { object: obj.id(), message: e.to_string() }),
            }
        }
        if failures.is_empty() {
            Ok(set)
        } else {
            Err(Error::Delete(failures))
        }
    }

    /// Blocks until every object is ready or `opts.timeout` elapses.
    async fn wait(&self, objects: &[ObjectRef], opts: WaitOptions) -> Result<()>;

    /// Blocks until every object is gone from the cluster or `opts.timeout` elapses.
    async fn wait_for_termination(&self, objects: &[ObjectRef], opts: WaitOptions) -> Result<()>;
}

#[async_trait]
impl<T: ApplyEngine + ?Sized> ApplyEngine for Arc<T> {
    async fn apply(&self, object: &Resource, opts: ApplyOptions) -> Result<Change> { (**self).apply(object, opts).await }
    async fn delete(&self, object: &ObjectRef, opts: DeleteOptions) -> Result<Change> {
        (**self).delete(object, opts).await
    }
    async fn wait(&self, objects: &[ObjectRef], opts: WaitOptions) -> Result<()> { (**self).wait(objects, opts).await }
    async fn wait_for_termination(&self, objects: &[ObjectRef], opts: WaitOptions) -> Result<()> {
        (**self).wait_for_termination(objects, opts).await
    }
}
