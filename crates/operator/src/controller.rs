//! Wiring of the reconciler into `kube_runtime::Controller`.
//!
//! The controller owns watching, queueing and retry timing. It never runs two
//! reconciles for the same WorkerMesh at once, and maps changes on owned
//! StatefulSets and Services back to their owner through owner references.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{self, Action, Config as ControllerConfig, Controller};
use kube_runtime::watcher;
use tracing::{debug, error, info, warn};

use crate::config::OperatorConfig;
use crate::converge::UpsertOutcome;
use crate::crd::WorkerMesh;
use crate::error::{Error, Result};
use crate::reconcile::{Outcome, Reconciler, StatusWrite};
use crate::store::{KubeStore, ObjectKey, ObjectStore};
use crate::telemetry::{OWNED_WRITES, RECONCILE_DURATION, RECONCILE_TOTAL};

/// Per-key exponential retry delay. Success clears the key.
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: Mutex::new(HashMap::new()) }
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let attempt = failures.entry(key.clone()).or_insert(0);
        let delay = self.base.saturating_mul(2u32.saturating_pow(*attempt)).min(self.max);
        *attempt = attempt.saturating_add(1);
        delay
    }

    pub fn max_delay(&self) -> Duration { self.max }

    pub fn reset(&self, key: &ObjectKey) {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).remove(key);
    }

    /// Number of keys currently backing off.
    pub fn tracked(&self) -> usize { self.failures.lock().unwrap_or_else(|p| p.into_inner()).len() }
}

/// A requeue for a WorkerMesh that has since been deleted never reaches
/// `reconcile`; the controller reports it as `ObjectNotFound` instead.
fn forget_deleted<Q: 'static>(backoff: &RetryBackoff, err: &controller::Error<Error, Q>) {
    if let controller::Error::ObjectNotFound(obj) = err {
        if let Some(ns) = &obj.namespace {
            backoff.reset(&ObjectKey::new(ns.clone(), obj.name.clone()));
        }
    }
}

pub struct Context<S> {
    pub reconciler: Reconciler<S>,
    pub backoff: RetryBackoff,
}

impl<S: ObjectStore> Context<S> {
    pub fn new(reconciler: Reconciler<S>, backoff: RetryBackoff) -> Self { Self { reconciler, backoff } }
}

fn mesh_key(mesh: &WorkerMesh) -> Result<ObjectKey> {
    ObjectKey::of(mesh).ok_or_else(|| Error::invariant(format!("WorkerMesh {} without namespace", mesh.name_any())))
}

fn record_write(kind: &str, outcome: UpsertOutcome) {
    if outcome.wrote() {
        OWNED_WRITES.with_label_values(&[kind, outcome.as_str()]).inc();
    }
}

/// Controller entry point: reconcile the mesh identified by `mesh`.
pub async fn reconcile<S: ObjectStore>(mesh: Arc<WorkerMesh>, ctx: Arc<Context<S>>) -> Result<Action> {
    let key = mesh_key(&mesh)?;
    let start = Instant::now();
    let result = ctx.reconciler.reconcile(&key).await;
    let label = match &result {
        Ok(Outcome::Deleted) => "deleted",
        Ok(Outcome::Converged(_)) => "converged",
        Err(e) => e.kind(),
    };
    RECONCILE_TOTAL.with_label_values(&[label]).inc();
    RECONCILE_DURATION.with_label_values(&[label]).observe(start.elapsed().as_secs_f64());
    match result? {
        Outcome::Deleted => debug!(mesh=%key, "reconcile.deleted"),
        Outcome::Converged(report) => {
            record_write("Service", report.service);
            record_write("StatefulSet", report.stateful_set);
            if report.status == StatusWrite::Updated {
                OWNED_WRITES.with_label_values(&["WorkerMesh", "status"]).inc();
            }
        }
    }
    ctx.backoff.reset(&key);
    // Owned StatefulSet changes re-trigger us; no periodic requeue needed.
    Ok(Action::await_change())
}

/// Retry failed reconciles with per-key backoff. Errors that will not clear on
/// their own still retry, at the maximum delay.
pub fn error_policy<S: ObjectStore>(mesh: Arc<WorkerMesh>, err: &Error, ctx: Arc<Context<S>>) -> Action {
    let Ok(key) = mesh_key(&mesh) else {
        error!(error=%err, "reconcile failed for WorkerMesh without key");
        return Action::requeue(ctx.backoff.max_delay());
    };
    if err.is_retryable() {
        let delay = ctx.backoff.next_delay(&key);
        match err {
            Error::Conflict { .. } => debug!(mesh=%key, error=%err, ?delay, "reconcile.conflict"),
            _ => warn!(mesh=%key, error=%err, ?delay, "reconcile.retry"),
        }
        Action::requeue(delay)
    } else {
        error!(mesh=%key, error=%err, kind=err.kind(), "reconcile.failed");
        Action::requeue(ctx.backoff.max_delay())
    }
}

/// Run the WorkerMesh controller until a shutdown signal arrives.
pub async fn run(client: Client, cfg: OperatorConfig) -> anyhow::Result<()> {
    let (meshes, statefulsets, services): (Api<WorkerMesh>, Api<StatefulSet>, Api<Service>) = match &cfg.namespace {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client.clone(), ns), Api::namespaced(client.clone(), ns)),
        None => (Api::all(client.clone()), Api::all(client.clone()), Api::all(client.clone())),
    };
    let owned = watcher::Config::default().labels(&cfg.mesh.app_selector());
    let store = Arc::new(KubeStore::new(client, cfg.field_manager.clone()));
    let ctx = Arc::new(Context::new(
        Reconciler::new(store, cfg.mesh.clone()),
        RetryBackoff::new(cfg.retry_base(), cfg.retry_max()),
    ));
    let tracker = Arc::clone(&ctx);
    info!(namespace=?cfg.namespace, concurrency=cfg.max_concurrent_reconciles, "controller starting");

    Controller::new(meshes, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(cfg.max_concurrent_reconciles))
        .owns(statefulsets, owned.clone())
        .owns(services, owned)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            if let Err(e) = &res {
                forget_deleted(&tracker.backoff, e);
            }
            async move {
                match res {
                    Ok((obj, _)) => debug!(mesh=%obj, "reconcile.done"),
                    Err(e) => debug!(error=%e, "reconcile.dispatch_error"),
                }
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}
