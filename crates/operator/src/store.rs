//! Typed access to cluster objects.
//!
//! Reconciliation only talks to the cluster through [`ObjectStore`]. Writes are
//! conditional: `replace` and `update_status` carry the `resourceVersion` that was
//! read, and a stale version surfaces as [`Error::Conflict`] instead of blocking.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::crd::WorkerMesh;
use crate::error::{Error, Result};

/// Namespace/name identity of a namespaced object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of an existing object; `None` when name or namespace is unset.
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

/// Namespaced kinds the store can read and write.
pub trait StoredObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn kind_name() -> String { Self::kind(&()).to_string() }
}

impl<K> StoredObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch an object; `Ok(None)` when it does not exist.
    async fn get<K: StoredObject>(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// Create an object that was absent when read. Fails with `Conflict` if it now exists.
    async fn create<K: StoredObject>(&self, obj: &K) -> Result<K>;

    /// Replace an object, guarded by the `resourceVersion` it carries.
    async fn replace<K: StoredObject>(&self, obj: &K) -> Result<K>;

    /// Write only the status of a WorkerMesh, guarded by its `resourceVersion`.
    async fn update_status(&self, mesh: &WorkerMesh) -> Result<WorkerMesh>;
}

/// Store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into() }
    }

    fn api<K: StoredObject>(&self, namespace: &str) -> Api<K> { Api::namespaced(self.client.clone(), namespace) }

    fn post_params(&self) -> PostParams {
        PostParams { dry_run: false, field_manager: Some(self.field_manager.clone()) }
    }
}

fn key_of<K: StoredObject>(obj: &K) -> Result<ObjectKey> {
    ObjectKey::of(obj).ok_or_else(|| Error::invariant(format!("{} without name or namespace", K::kind_name())))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoredObject>(&self, key: &ObjectKey) -> Result<Option<K>> {
        self.api::<K>(&key.namespace).get_opt(&key.name).await.map_err(|e| Error::from_kube(&K::kind_name(), key, e))
    }

    async fn create<K: StoredObject>(&self, obj: &K) -> Result<K> {
        let key = key_of(obj)?;
        debug!(kind=%K::kind_name(), %key, "store.create");
        self.api::<K>(&key.namespace).create(&self.post_params(), obj).await.map_err(|e| Error::from_kube(&K::kind_name(), &key, e))
    }

    async fn replace<K: StoredObject>(&self, obj: &K) -> Result<K> {
        let key = key_of(obj)?;
        debug!(kind=%K::kind_name(), %key, rv=?obj.resource_version(), "store.replace");
        self.api::<K>(&key.namespace).replace(&key.name, &self.post_params(), obj).await.map_err(|e| Error::from_kube(&K::kind_name(), &key, e))
    }

    async fn update_status(&self, mesh: &WorkerMesh) -> Result<WorkerMesh> {
        let key = key_of(mesh)?;
        // resourceVersion in a merge patch makes the API server reject stale writers with 409.
        let patch = json!({
            "metadata": { "resourceVersion": mesh.resource_version() },
            "status": mesh.status,
        });
        let params = PatchParams { field_manager: Some(self.field_manager.clone()), ..PatchParams::default() };
        self.api::<WorkerMesh>(&key.namespace)
            .patch_status(&key.name, &params, &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(&WorkerMesh::kind_name(), &key, e))
    }
}
