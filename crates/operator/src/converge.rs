//! Create-or-update of the objects owned by a WorkerMesh.
//!
//! Each upsert reads the current object (or starts from a default one), applies
//! the mutation in memory and persists it with one conditional write. Nothing is
//! written when the mutation leaves the object unchanged.

use std::fmt;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use tracing::debug;

use crate::crd::WorkerMesh;
use crate::error::{Error, Result};
use crate::mapper::{ServiceTarget, StatefulSetTarget};
use crate::store::{ObjectKey, ObjectStore, StoredObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }

    pub fn wrote(&self) -> bool { !matches!(self, Self::Unchanged) }
}

impl fmt::Display for UpsertOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Load-or-default `key`, run `mutate` on it, and persist the result if it changed.
///
/// Returns the object as the store holds it after the call.
pub async fn upsert<S, K, F>(store: &S, key: &ObjectKey, mutate: F) -> Result<(K, UpsertOutcome)>
where
    S: ObjectStore,
    K: StoredObject + Default + PartialEq,
    F: FnOnce(&mut K) -> Result<()> + Send,
{
    let kind = K::kind_name();
    let current: Option<K> = store.get(key).await?;
    let mut desired = match &current {
        Some(obj) => obj.clone(),
        None => {
            let mut obj = K::default();
            let meta = obj.meta_mut();
            meta.name = Some(key.name.clone());
            meta.namespace = Some(key.namespace.clone());
            obj
        }
    };
    mutate(&mut desired)?;
    if ObjectKey::of(&desired).as_ref() != Some(key) {
        return Err(Error::invariant(format!("mutation changed identity of {kind} {key}")));
    }

    match current {
        None => {
            let created = store.create(&desired).await?;
            debug!(%kind, %key, "upsert.created");
            Ok((created, UpsertOutcome::Created))
        }
        Some(current) if current == desired => {
            debug!(%kind, %key, "upsert.unchanged");
            Ok((current, UpsertOutcome::Unchanged))
        }
        Some(_) => {
            let updated = store.replace(&desired).await?;
            debug!(%kind, %key, "upsert.updated");
            Ok((updated, UpsertOutcome::Updated))
        }
    }
}

/// Make `owner` the controller of the object described by `meta`.
///
/// Fails if a different object already controls it.
pub fn set_controller_reference(owner: &WorkerMesh, kind: &str, meta: &mut ObjectMeta) -> Result<()> {
    let owner_ref = controller_ref(owner)?;
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    if let Some(other) = refs.iter().find(|r| r.controller == Some(true) && r.uid != owner_ref.uid) {
        let key = ObjectKey::new(meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default());
        return Err(Error::AlreadyOwned { kind: kind.to_string(), key, owner: format!("{}/{}", other.kind, other.name) });
    }
    match refs.iter_mut().find(|r| r.uid == owner_ref.uid) {
        Some(existing) => *existing = owner_ref,
        None => refs.push(owner_ref),
    }
    Ok(())
}

fn controller_ref(owner: &WorkerMesh) -> Result<OwnerReference> {
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::invariant(format!("WorkerMesh {:?} has no uid; cannot own objects", owner.meta().name))
    })
}

pub async fn converge_service<S: ObjectStore>(store: &S, owner: &WorkerMesh, target: &ServiceTarget) -> Result<(Service, UpsertOutcome)> {
    upsert(store, &target.key, |svc: &mut Service| {
        target.apply(svc);
        set_controller_reference(owner, "Service", &mut svc.metadata)
    })
    .await
}

pub async fn converge_stateful_set<S: ObjectStore>(
    store: &S,
    owner: &WorkerMesh,
    target: &StatefulSetTarget,
) -> Result<(StatefulSet, UpsertOutcome)> {
    upsert(store, &target.key, |sts: &mut StatefulSet| {
        target.apply(sts);
        set_controller_reference(owner, "StatefulSet", &mut sts.metadata)
    })
    .await
}
