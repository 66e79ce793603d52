//! Replica ownership between workloads and autoscalers.

use std::collections::BTreeSet;

use kustodian_core::{HasReplicaField, HasScaleTargetRef, Identified, ResourceId, ScaleTarget};
use tracing::info;

/// Removes the declared replica count from every workload that an autoscaler in
/// the same set targets, so the autoscaler owns that field. Evaluated over the
/// whole candidate set at once since the autoscaler may appear anywhere in it.
/// Returns the workloads that were changed.
pub fn cede_replicas<T>(objects: &mut [T]) -> Vec<ResourceId>
where
    T: Identified + HasScaleTargetRef + HasReplicaField,
{
    let targets: BTreeSet<ScaleTarget> = objects.iter().filter_map(|o| o.scale_target_ref()).collect();
    if targets.is_empty() {
        return Vec::new();
    }
    let mut ceded = Vec::new();
    for obj in objects.iter_mut() {
        let id = obj.id();
        let key = ScaleTarget { namespace: id.namespace.clone(), kind: id.kind.clone(), name: id.name.clone() };
        if targets.contains(&key) && obj.clear_replicas() {
            info!(object = %id, "replicas left to autoscaler");
            ceded.push(id);
        }
    }
    ceded
}
