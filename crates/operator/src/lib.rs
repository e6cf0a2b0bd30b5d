//! Aether operator: keeps every WorkerMesh backed by a headless Service and a
//! parallel StatefulSet, and reports worker readiness on the WorkerMesh status.

pub mod config;
pub mod controller;
pub mod converge;
pub mod crd;
pub mod error;
pub mod logging;
pub mod mapper;
pub mod reconcile;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod test_support;

pub use crd::{Condition, ConditionStatus, WorkerMesh, WorkerMeshSpec, WorkerMeshStatus};
pub use error::{Error, Result};
pub use reconcile::{Outcome, ReconcileReport, Reconciler, StatusWrite};
pub use store::{KubeStore, ObjectKey, ObjectStore};
