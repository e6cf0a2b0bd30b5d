use aether_operator::crd::{Condition, ConditionStatus};
use aether_operator::{WorkerMesh, WorkerMeshSpec, WorkerMeshStatus};
use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::{Container, PodSpec};
use kube::CustomResourceExt;
use serde_json::json;

fn worker_spec(port: i32) -> WorkerMeshSpec {
    WorkerMeshSpec {
        replicas: 3,
        port,
        pod_template: PodSpec {
            containers: vec![Container { name: "worker".into(), image: Some("x".into()), ..Default::default() }],
            ..Default::default()
        },
    }
}

#[test]
fn spec_roundtrip_uses_camel_case() {
    let original = worker_spec(7000);
    let j = serde_json::to_value(&original).unwrap();
    assert_eq!(j, json!({"replicas":3,"port":7000,"podTemplate":{"containers":[{"name":"worker","image":"x"}]}}));
    let back: WorkerMeshSpec = serde_json::from_value(j).unwrap();
    assert_eq!(back, original);
}

#[test]
fn unset_port_is_omitted_and_defaults_to_zero() {
    let j = serde_json::to_value(worker_spec(0)).unwrap();
    assert!(j.get("port").is_none(), "got {j}");
    let back: WorkerMeshSpec = serde_json::from_value(json!({"replicas":1,"podTemplate":{"containers":[]}})).unwrap();
    assert_eq!(back.port, 0);
}

#[test]
fn status_condition_wire_format() {
    let status = WorkerMeshStatus {
        replicas: 3,
        ready_replicas: 3,
        observed_generation: Some(2),
        conditions: vec![Condition {
            type_: "Ready".into(),
            status: ConditionStatus::True,
            reason: "AllReady".into(),
            message: "3/3 replicas ready".into(),
            last_transition_time: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            observed_generation: Some(2),
        }],
    };
    let j = serde_json::to_value(&status).unwrap();
    assert_eq!(j["readyReplicas"], 3);
    assert_eq!(j["conditions"][0]["type"], "Ready");
    assert_eq!(j["conditions"][0]["status"], "True");
    assert_eq!(j["conditions"][0]["lastTransitionTime"], "2024-01-02T03:04:05Z");
}

#[test]
fn crd_yaml_names_the_resource() {
    let yaml = serde_yaml::to_string(&WorkerMesh::crd()).unwrap();
    assert!(yaml.contains("name: workermeshes.aether.dev"));
    assert!(yaml.contains("x-kubernetes-preserve-unknown-fields: true"));
    assert!(yaml.contains("status: {}"), "status subresource enabled:\n{yaml}");
}
