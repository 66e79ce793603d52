//! Kustodian plan: stage partitioning and deterministic apply order.
//!
//! Foundational objects (CRDs and Namespaces) form stage one and must converge
//! before anything in stage two is submitted. Both stages are ordered by
//! `(kind precedence, kind, namespace, name, group)`, which is a total order on
//! identities, so a plan never depends on the order objects were rendered in.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BTreeSet;

use kustodian_core::{Error, Identified, ResourceId, Result};
use tracing::debug;

mod conflict;

pub use conflict::cede_replicas;

/// Apply precedence for well-known kinds; anything else sorts after these.
pub const KIND_ORDER: &[&str] = &[
    "CustomResourceDefinition",
    "Namespace",
    "ResourceQuota",
    "StorageClass",
    "ServiceAccount",
    "PodSecurityPolicy",
    "Role",
    "ClusterRole",
    "RoleBinding",
    "ClusterRoleBinding",
    "ConfigMap",
    "Secret",
    "Service",
    "LimitRange",
    "PriorityClass",
    "Deployment",
    "StatefulSet",
    "CronJob",
    "PodDisruptionBudget",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

pub fn kind_rank(kind: &str) -> usize {
    KIND_ORDER.iter().position(|k| *k == kind).unwrap_or(KIND_ORDER.len())
}

/// Plan order between two identities.
pub fn compare(a: &ResourceId, b: &ResourceId) -> Ordering {
    kind_rank(&a.kind)
        .cmp(&kind_rank(&b.kind))
        .then_with(|| a.kind.cmp(&b.kind))
        .then_with(|| a.namespace.cmp(&b.namespace))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.group.cmp(&b.group))
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan<T> {
    pub foundational: Vec<T>,
    pub dependent: Vec<T>,
}

impl<T> StagePlan<T> {
    pub fn len(&self) -> usize { self.foundational.len() + self.dependent.len() }
    pub fn is_empty(&self) -> bool { self.foundational.is_empty() && self.dependent.is_empty() }

    /// Apply order: all of stage one, then stage two.
    pub fn iter(&self) -> impl Iterator<Item = &T> { self.foundational.iter().chain(self.dependent.iter()) }

    pub fn into_ordered(self) -> Vec<T> {
        let mut out = self.foundational;
        out.extend(self.dependent);
        out
    }
}

fn sort_by_plan_order<T: Identified>(items: &mut [T]) {
    items.sort_by_cached_key(|item| {
        let id = item.id();
        (kind_rank(&id.kind), id.kind, id.namespace, id.name, id.group)
    });
}

/// Partitions `objects` into stages. Two objects with the same identity cannot be
/// ordered against each other and fail the plan.
pub fn plan<T: Identified>(objects: Vec<T>) -> Result<StagePlan<T>> {
    let mut seen = BTreeSet::new();
    for obj in &objects {
        let id = obj.id();
        if !seen.insert(id.clone()) {
            return Err(Error::plan(format!("duplicate object {}", id)));
        }
    }
    let (mut foundational, mut dependent): (Vec<T>, Vec<T>) =
        objects.into_iter().partition(|o| o.id().is_foundational());
    sort_by_plan_order(&mut foundational);
    sort_by_plan_order(&mut dependent);
    debug!(foundational = foundational.len(), dependent = dependent.len(), "plan computed");
    Ok(StagePlan { foundational, dependent })
}

/// Reverse of plan order: dependents first, foundational objects last, so a
/// Namespace or CRD is never removed while instances that need it remain.
pub fn teardown_order<T: Identified>(objects: Vec<T>) -> Vec<T> {
    let (mut foundational, mut dependent): (Vec<T>, Vec<T>) =
        objects.into_iter().partition(|o| o.id().is_foundational());
    sort_by_plan_order(&mut foundational);
    sort_by_plan_order(&mut dependent);
    dependent.reverse();
    foundational.reverse();
    dependent.extend(foundational);
    dependent
}
