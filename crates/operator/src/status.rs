//! Status projection: StatefulSet live status -> WorkerMesh status.

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSetStatus;

use crate::crd::{Condition, ConditionStatus, WorkerMesh, WorkerMeshStatus};

pub const READY: &str = "Ready";
pub const REASON_ALL_READY: &str = "AllReady";
pub const REASON_WAITING: &str = "Waiting";

/// Compute the status to persist for `mesh` given the StatefulSet's live status.
///
/// Pure: the same inputs and `now` always give the same output, and `now` only
/// lands in a condition whose status flips.
pub fn project(mesh: &WorkerMesh, live: Option<&StatefulSetStatus>, now: DateTime<Utc>) -> WorkerMeshStatus {
    let replicas = live.map(|s| s.replicas).unwrap_or(0);
    let ready = live.and_then(|s| s.ready_replicas).unwrap_or(0);
    let desired = mesh.spec.replicas;
    let generation = mesh.metadata.generation;

    let mut status = mesh.status.clone().unwrap_or_default();
    status.replicas = replicas;
    status.ready_replicas = ready;
    status.observed_generation = generation;
    set_condition(&mut status.conditions, ready_condition(ready, desired, generation, now));
    status
}

pub fn ready_condition(ready: i32, desired: i32, generation: Option<i64>, now: DateTime<Utc>) -> Condition {
    let (status, reason) = if ready == desired {
        (ConditionStatus::True, REASON_ALL_READY)
    } else {
        (ConditionStatus::False, REASON_WAITING)
    };
    Condition {
        type_: READY.to_string(),
        status,
        reason: reason.to_string(),
        message: format!("{ready}/{desired} replicas ready"),
        last_transition_time: now,
        observed_generation: generation,
    }
}

/// Insert or update `new` by type, keeping the list sorted by type.
///
/// An existing condition keeps its `last_transition_time` unless its status changes.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status != new.status {
                existing.status = new.status;
                existing.last_transition_time = new.last_transition_time;
            }
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
        }
        None => {
            let at = conditions.partition_point(|c| c.type_ < new.type_);
            conditions.insert(at, new);
        }
    }
}
