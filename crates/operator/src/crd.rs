use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodSpec;
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Desired state of a group of mesh workers.
///
/// The operator owns two objects per WorkerMesh: a headless Service used for
/// DNS discovery between workers and a StatefulSet running the workers.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[kube(
    group = "aether.dev",
    version = "v1alpha1",
    kind = "WorkerMesh",
    plural = "workermeshes",
    shortname = "wm",
    namespaced,
    status = "WorkerMeshStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMeshSpec {
    /// Number of worker pods.
    #[schemars(range(min = 1))]
    pub replicas: i32,

    /// Port workers listen on for mesh traffic. 0 selects the operator default.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: i32,

    /// Pod specification for the workers. Labels are injected by the operator.
    #[schemars(schema_with = "preserve_unknown_object")]
    pub pod_template: PodSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMeshStatus {
    /// Pods targeted by the StatefulSet.
    #[serde(default)]
    pub replicas: i32,
    /// Pods reporting ready.
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl WorkerMeshStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => f.write_str("True"),
            ConditionStatus::False => f.write_str("False"),
            ConditionStatus::Unknown => f.write_str("Unknown"),
        }
    }
}

fn is_zero(v: &i32) -> bool { *v == 0 }

// PodSpec is validated by the API server when the StatefulSet is written, so
// the CRD only needs to accept it as an opaque object.
fn preserve_unknown_object(_: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject { instance_type: Some(InstanceType::Object.into()), ..Default::default() };
    obj.extensions.insert("x-kubernetes-preserve-unknown-fields".into(), serde_json::Value::Bool(true));
    Schema::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn crd_metadata() {
        let crd = WorkerMesh::crd();
        assert_eq!(crd.spec.group, "aether.dev");
        assert_eq!(crd.spec.names.kind, "WorkerMesh");
        assert_eq!(crd.spec.names.plural, "workermeshes");
        assert_eq!(crd.spec.scope, "Namespaced");
        let version = &crd.spec.versions[0];
        assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some(), "status subresource missing");
    }

    #[test]
    fn pod_template_schema_preserves_unknown_fields() {
        let crd = serde_json::to_value(WorkerMesh::crd()).unwrap();
        let pod = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"]["properties"]["podTemplate"];
        assert_eq!(pod["type"], "object");
        assert_eq!(pod["x-kubernetes-preserve-unknown-fields"], true);
    }
}
