//! Test harness utilities: an in-memory [`ObjectStore`] and WorkerMesh fixtures.
//!
//! `MemoryStore` behaves like the API server where reconciliation can observe it:
//! monotonic `resourceVersion`s with stale-write rejection, `status` preserved on
//! `replace`, a separate status write path, and cascading deletion through owner
//! references. Every write is journaled so tests can assert order and count, and
//! `before_next` interleaves another writer between a caller's read and its write.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;

use crate::crd::{WorkerMesh, WorkerMeshSpec};
use crate::error::{Error, Result};
use crate::store::{ObjectKey, ObjectStore, StoredObject};

/// WorkerMesh in namespace `default` with a uid and generation 1, as if read back from the cluster.
pub fn mesh(name: &str, replicas: i32, port: i32) -> WorkerMesh {
    let mut m = WorkerMesh::new(name, WorkerMeshSpec { replicas, port, pod_template: PodSpec::default() });
    m.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("default".to_string()),
        uid: Some(format!("uid-{name}")),
        generation: Some(1),
        ..Default::default()
    };
    m
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Replace,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub kind: String,
    pub name: String,
    pub op: WriteOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Conflict,
    Unavailable,
}

type StoreKey = (String, String, String);

type Hook = Box<dyn FnOnce(&MemoryStore) + Send>;

#[derive(Default)]
struct Inner {
    objects: BTreeMap<StoreKey, Value>,
    version: u64,
    uids: u64,
    journal: Vec<WriteRecord>,
    faults: Vec<(String, WriteOp, Fault)>,
    hooks: Vec<(String, WriteOp, Hook)>,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn take_fault(&mut self, kind: &str, op: WriteOp) -> Option<Fault> {
        let idx = self.faults.iter().position(|(k, o, _)| k == kind && *o == op)?;
        Some(self.faults.remove(idx).2)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn store_key(kind: &str, key: &ObjectKey) -> StoreKey { (kind.to_string(), key.namespace.clone(), key.name.clone()) }

fn key_of<K: StoredObject>(obj: &K) -> Result<ObjectKey> {
    ObjectKey::of(obj).ok_or_else(|| Error::invariant(format!("{} without name or namespace", K::kind_name())))
}

fn resource_version(v: &Value) -> Option<&str> { v["metadata"]["resourceVersion"].as_str() }

fn fault_error(fault: Fault, kind: &str, key: &ObjectKey) -> Error {
    match fault {
        Fault::Conflict => Error::Conflict { kind: kind.to_string(), key: key.clone(), message: "injected conflict".into() },
        Fault::Unavailable => Error::StoreUnavailable(format!("injected outage writing {kind} {key}")),
    }
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Store `obj` as if another actor created it: assigns uid and resourceVersion, not journaled.
    pub fn insert<K: StoredObject>(&self, obj: &K) -> K {
        let key = key_of(obj).expect("fixture needs name and namespace");
        let mut inner = self.lock();
        let mut value = serde_json::to_value(obj).expect("serialize fixture");
        if value["metadata"]["uid"].is_null() {
            inner.uids += 1;
            value["metadata"]["uid"] = Value::String(format!("uid-{}", inner.uids));
        }
        if value["metadata"]["generation"].is_null() {
            value["metadata"]["generation"] = Value::from(1);
        }
        value["metadata"]["resourceVersion"] = Value::String(inner.next_version());
        inner.objects.insert(store_key(&K::kind_name(), &key), value.clone());
        serde_json::from_value(value).expect("deserialize fixture")
    }

    pub fn object<K: StoredObject>(&self, key: &ObjectKey) -> Option<K> {
        let inner = self.lock();
        let value = inner.objects.get(&store_key(&K::kind_name(), key))?.clone();
        Some(serde_json::from_value(value).expect("stored object deserializes"))
    }

    /// Bump the resourceVersion of a stored object, simulating a concurrent writer.
    pub fn touch<K: StoredObject>(&self, key: &ObjectKey) {
        let mut inner = self.lock();
        let rv = inner.next_version();
        if let Some(v) = inner.objects.get_mut(&store_key(&K::kind_name(), key)) {
            v["metadata"]["resourceVersion"] = Value::String(rv);
        }
    }

    /// Mutate a stored object's spec as the user would (bumps generation and resourceVersion).
    pub fn edit<K: StoredObject>(&self, key: &ObjectKey, f: impl FnOnce(&mut K)) {
        let mut obj: K = self.object(key).expect("object to edit exists");
        f(&mut obj);
        let mut inner = self.lock();
        let rv = inner.next_version();
        let mut value = serde_json::to_value(&obj).expect("serialize edit");
        let generation = value["metadata"]["generation"].as_i64().unwrap_or(0) + 1;
        value["metadata"]["generation"] = Value::from(generation);
        value["metadata"]["resourceVersion"] = Value::String(rv);
        inner.objects.insert(store_key(&K::kind_name(), key), value);
    }

    /// Report live StatefulSet status, as the StatefulSet controller would.
    pub fn set_stateful_set_status(&self, key: &ObjectKey, replicas: i32, ready: i32) {
        let status = StatefulSetStatus { replicas, ready_replicas: Some(ready), ..Default::default() };
        let mut inner = self.lock();
        let rv = inner.next_version();
        let v = inner
            .objects
            .get_mut(&store_key(&StatefulSet::kind_name(), key))
            .expect("statefulset exists before its status is set");
        v["status"] = serde_json::to_value(status).expect("serialize status");
        v["metadata"]["resourceVersion"] = Value::String(rv);
    }

    /// Fail the next `op` on `kind` with `fault`.
    pub fn fail_next(&self, kind: &str, op: WriteOp, fault: Fault) { self.lock().faults.push((kind.to_string(), op, fault)); }

    /// Run `hook` right before the next `op` on `kind`, after the caller has read its copy.
    /// Lets tests interleave a concurrent writer between read and write.
    pub fn before_next(&self, kind: &str, op: WriteOp, hook: impl FnOnce(&MemoryStore) + Send + 'static) {
        self.lock().hooks.push((kind.to_string(), op, Box::new(hook)));
    }

    fn run_hook(&self, kind: &str, op: WriteOp) {
        let hook = {
            let mut inner = self.lock();
            inner.hooks.iter().position(|(k, o, _)| k == kind && *o == op).map(|idx| inner.hooks.remove(idx).2)
        };
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// Delete an object and, transitively, everything it owns.
    pub fn delete<K: StoredObject>(&self, key: &ObjectKey) -> bool {
        let mut inner = self.lock();
        let Some(removed) = inner.objects.remove(&store_key(&K::kind_name(), key)) else { return false };
        let mut pending: Vec<String> = removed["metadata"]["uid"].as_str().map(str::to_string).into_iter().collect();
        while let Some(uid) = pending.pop() {
            let owned: Vec<StoreKey> = inner
                .objects
                .iter()
                .filter(|(_, v)| {
                    v["metadata"]["ownerReferences"].as_array().is_some_and(|refs| refs.iter().any(|r| r["uid"] == uid.as_str()))
                })
                .map(|(k, _)| k.clone())
                .collect();
            for k in owned {
                if let Some(v) = inner.objects.remove(&k) {
                    pending.extend(v["metadata"]["uid"].as_str().map(str::to_string));
                }
            }
        }
        true
    }

    pub fn writes(&self) -> Vec<WriteRecord> { self.lock().journal.clone() }

    pub fn clear_writes(&self) { self.lock().journal.clear(); }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoredObject>(&self, key: &ObjectKey) -> Result<Option<K>> {
        let inner = self.lock();
        match inner.objects.get(&store_key(&K::kind_name(), key)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn create<K: StoredObject>(&self, obj: &K) -> Result<K> {
        let kind = K::kind_name();
        self.run_hook(&kind, WriteOp::Create);
        let key = key_of(obj)?;
        let mut inner = self.lock();
        if let Some(fault) = inner.take_fault(&kind, WriteOp::Create) {
            return Err(fault_error(fault, &kind, &key));
        }
        let skey = store_key(&kind, &key);
        if inner.objects.contains_key(&skey) {
            return Err(Error::Conflict { kind, key, message: "already exists".into() });
        }
        let mut value = serde_json::to_value(obj)?;
        inner.uids += 1;
        value["metadata"]["uid"] = Value::String(format!("uid-{}", inner.uids));
        value["metadata"]["generation"] = Value::from(1);
        value["metadata"]["resourceVersion"] = Value::String(inner.next_version());
        if let Some(m) = value.as_object_mut() {
            m.remove("status");
        }
        inner.objects.insert(skey, value.clone());
        inner.journal.push(WriteRecord { kind, name: key.name.clone(), op: WriteOp::Create });
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: StoredObject>(&self, obj: &K) -> Result<K> {
        let kind = K::kind_name();
        self.run_hook(&kind, WriteOp::Replace);
        let key = key_of(obj)?;
        let mut inner = self.lock();
        if let Some(fault) = inner.take_fault(&kind, WriteOp::Replace) {
            return Err(fault_error(fault, &kind, &key));
        }
        let skey = store_key(&kind, &key);
        let Some(stored) = inner.objects.get(&skey).cloned() else {
            return Err(Error::Conflict { kind, key, message: "not found".into() });
        };
        let mut value = serde_json::to_value(obj)?;
        if resource_version(&value) != resource_version(&stored) {
            return Err(Error::Conflict { kind, key, message: "the object has been modified".into() });
        }
        // status belongs to the status subresource
        match stored.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Some(m) = value.as_object_mut() {
                    m.remove("status");
                }
            }
        }
        let generation = stored["metadata"]["generation"].as_i64().unwrap_or(1);
        let bumped = if value.get("spec") != stored.get("spec") { generation + 1 } else { generation };
        value["metadata"]["generation"] = Value::from(bumped);
        value["metadata"]["uid"] = stored["metadata"]["uid"].clone();
        value["metadata"]["resourceVersion"] = Value::String(inner.next_version());
        inner.objects.insert(skey, value.clone());
        inner.journal.push(WriteRecord { kind, name: key.name.clone(), op: WriteOp::Replace });
        Ok(serde_json::from_value(value)?)
    }

    async fn update_status(&self, mesh: &WorkerMesh) -> Result<WorkerMesh> {
        let kind = WorkerMesh::kind_name();
        self.run_hook(&kind, WriteOp::Status);
        let key = key_of(mesh)?;
        let mut inner = self.lock();
        if let Some(fault) = inner.take_fault(&kind, WriteOp::Status) {
            return Err(fault_error(fault, &kind, &key));
        }
        let skey = store_key(&kind, &key);
        let Some(mut stored) = inner.objects.get(&skey).cloned() else {
            return Err(Error::Conflict { kind, key, message: "not found".into() });
        };
        if mesh.metadata.resource_version.as_deref() != resource_version(&stored) {
            return Err(Error::Conflict { kind, key, message: "the object has been modified".into() });
        }
        stored["status"] = serde_json::to_value(&mesh.status)?;
        stored["metadata"]["resourceVersion"] = Value::String(inner.next_version());
        inner.objects.insert(skey, stored.clone());
        inner.journal.push(WriteRecord { kind, name: key.name.clone(), op: WriteOp::Status });
        Ok(serde_json::from_value(stored)?)
    }
}
