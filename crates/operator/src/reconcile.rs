//! One level-triggered pass over a WorkerMesh.
//!
//! `Start -> Loaded -> Converged -> StatusUpdated -> Done`, or `NotFound -> Done`
//! when the WorkerMesh is gone. Any error stops the pass; whatever was already
//! converged stays in place and the next pass resumes from the cluster state.

use std::sync::Arc;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::config::MeshConfig;
use crate::converge::{converge_service, converge_stateful_set, UpsertOutcome};
use crate::crd::WorkerMesh;
use crate::error::Result;
use crate::mapper::MeshTargets;
use crate::status::project;
use crate::store::{ObjectKey, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub service: UpsertOutcome,
    pub stateful_set: UpsertOutcome,
    pub status: StatusWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The WorkerMesh no longer exists; its owned objects are left to garbage collection.
    Deleted,
    Converged(ReconcileReport),
}

pub struct Reconciler<S> {
    store: Arc<S>,
    config: MeshConfig,
}

impl<S> Clone for Reconciler<S> {
    fn clone(&self) -> Self { Self { store: Arc::clone(&self.store), config: self.config.clone() } }
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: Arc<S>, config: MeshConfig) -> Self { Self { store, config } }

    pub fn store(&self) -> &S { &self.store }

    pub fn config(&self) -> &MeshConfig { &self.config }

    #[instrument(skip_all, fields(mesh = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome> {
        let loaded: Option<WorkerMesh> = self.store.get(key).await?;
        let Some(mesh) = loaded else {
            debug!("reconcile.not_found");
            return Ok(Outcome::Deleted);
        };
        debug!(generation=?mesh.metadata.generation, "reconcile.loaded");

        let targets = MeshTargets::compute(&mesh, &self.config)?;
        // The Service goes first so member DNS records exist before the pods start.
        let (_, service) = converge_service(self.store.as_ref(), &mesh, &targets.service).await?;
        let (sts, stateful_set) = converge_stateful_set(self.store.as_ref(), &mesh, &targets.stateful_set).await?;
        debug!(%service, %stateful_set, "reconcile.converged");

        let projected = project(&mesh, sts.status.as_ref(), Utc::now());
        let status = if mesh.status.as_ref() == Some(&projected) {
            StatusWrite::Unchanged
        } else {
            let mut updated = mesh.clone();
            updated.status = Some(projected);
            self.store.update_status(&updated).await?;
            StatusWrite::Updated
        };

        let report = ReconcileReport { service, stateful_set, status };
        if service.wrote() || stateful_set.wrote() || status == StatusWrite::Updated {
            info!(name=%mesh.name_any(), service=%service, stateful_set=%stateful_set, status_updated=(status == StatusWrite::Updated), "reconcile.applied");
        } else {
            debug!("reconcile.noop");
        }
        Ok(Outcome::Converged(report))
    }
}
