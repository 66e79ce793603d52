//! Readiness of a live object, judged from its status.

use kustodian_core::ResourceId;
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    InProgress(String),
    /// Terminal; waiting longer will not help.
    Failed(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool { matches!(self, Readiness::Ready) }
}

fn int_at(v: &Json, path: &[&str]) -> Option<i64> {
    let mut cur = v;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_i64()
}

/// Status and message of condition `kind`, when present.
fn condition(v: &Json, kind: &str) -> Option<(bool, String)> {
    let conditions = v.get("status")?.get("conditions")?.as_array()?;
    let c = conditions.iter().find(|c| c.get("type").and_then(Json::as_str) == Some(kind))?;
    let status = c.get("status").and_then(Json::as_str) == Some("True");
    let message = c.get("message").and_then(Json::as_str).unwrap_or_default().to_string();
    Some((status, message))
}

/// The controller has seen the latest spec. Objects without a generation are treated as current.
fn generation_observed(v: &Json) -> bool {
    match (int_at(v, &["metadata", "generation"]), int_at(v, &["status", "observedGeneration"])) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

fn replicas_ready(v: &Json, ready_field: &str) -> Readiness {
    if !generation_observed(v) {
        return Readiness::InProgress("generation not yet observed".into());
    }
    let want = int_at(v, &["spec", "replicas"]).unwrap_or(1);
    let have = int_at(v, &["status", ready_field]).unwrap_or(0);
    if have >= want {
        Readiness::Ready
    } else {
        Readiness::InProgress(format!("{}/{} replicas ready", have, want))
    }
}

pub fn evaluate(id: &ResourceId, live: &Json) -> Readiness {
    match (id.group.as_str(), id.kind.as_str()) {
        ("apiextensions.k8s.io", "CustomResourceDefinition") => match condition(live, "Established") {
            Some((true, _)) => Readiness::Ready,
            _ => Readiness::InProgress("not established".into()),
        },
        ("", "Namespace") => match live.get("status").and_then(|s| s.get("phase")).and_then(Json::as_str) {
            Some("Active") | None => Readiness::Ready,
            Some(phase) => Readiness::InProgress(format!("phase {}", phase)),
        },
        ("apps", "Deployment") => {
            if !generation_observed(live) {
                return Readiness::InProgress("generation not yet observed".into());
            }
            if let Some((true, msg)) = condition(live, "ReplicaFailure") {
                return Readiness::Failed(msg);
            }
            match condition(live, "Available") {
                Some((true, _)) => Readiness::Ready,
                Some((false, msg)) => Readiness::InProgress(msg),
                None => Readiness::InProgress("not available".into()),
            }
        }
        ("apps", "StatefulSet") | ("apps", "ReplicaSet") => replicas_ready(live, "readyReplicas"),
        ("apps", "DaemonSet") => {
            if !generation_observed(live) {
                return Readiness::InProgress("generation not yet observed".into());
            }
            let want = int_at(live, &["status", "desiredNumberScheduled"]).unwrap_or(0);
            let have = int_at(live, &["status", "numberReady"]).unwrap_or(0);
            if have >= want {
                Readiness::Ready
            } else {
                Readiness::InProgress(format!("{}/{} pods ready", have, want))
            }
        }
        ("batch", "Job") => {
            if let Some((true, msg)) = condition(live, "Failed") {
                return Readiness::Failed(msg);
            }
            match condition(live, "Complete") {
                Some((true, _)) => Readiness::Ready,
                _ => Readiness::InProgress("not complete".into()),
            }
        }
        _ => match condition(live, "Ready") {
            Some((false, msg)) => Readiness::InProgress(msg),
            _ => Readiness::Ready,
        },
    }
}
