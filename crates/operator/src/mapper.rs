//! Pure mapping from a WorkerMesh to the field values of the objects it owns.
//!
//! Both owned objects, both selectors and the pod template carry the same two
//! labels: `<mesh_label_key>: <mesh name>` and `<app_label_key>: <app_label_value>`.
//! Workers find each other through the headless Service, so any drift between
//! those label sets breaks discovery.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec, Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::config::MeshConfig;
use crate::crd::WorkerMesh;
use crate::error::{Error, Result};
use crate::store::ObjectKey;

pub const HEADLESS_CLUSTER_IP: &str = "None";
pub const PARALLEL_POD_MANAGEMENT: &str = "Parallel";
/// StatefulSet annotation holding the sha256 of the pod template last written.
pub const POD_TEMPLATE_HASH_ANNOTATION: &str = "aether.dev/pod-template-hash";
const TCP: &str = "TCP";

pub type Labels = BTreeMap<String, String>;

/// `spec.port` when set, otherwise the configured default. Values are not validated.
pub fn effective_port(spec_port: i32, default_port: i32) -> i32 {
    if spec_port != 0 { spec_port } else { default_port }
}

pub fn mesh_labels(mesh_name: &str, cfg: &MeshConfig) -> Labels {
    BTreeMap::from([
        (cfg.mesh_label_key.clone(), mesh_name.to_string()),
        (cfg.app_label_key.clone(), cfg.app_label_value.clone()),
    ])
}

pub fn service_name(mesh_name: &str, cfg: &MeshConfig) -> String { format!("{mesh_name}{}", cfg.service_suffix) }

pub fn pod_spec_hash(pod_spec: &PodSpec) -> Result<String> {
    let bytes = serde_json::to_vec(pod_spec)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceTarget {
    pub key: ObjectKey,
    pub labels: Labels,
    pub selector: Labels,
    pub port_name: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatefulSetTarget {
    pub key: ObjectKey,
    pub labels: Labels,
    pub replicas: i32,
    pub service_name: String,
    pub pod_spec: PodSpec,
    pub pod_spec_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshTargets {
    pub labels: Labels,
    pub service: ServiceTarget,
    pub stateful_set: StatefulSetTarget,
}

impl MeshTargets {
    pub fn compute(mesh: &WorkerMesh, cfg: &MeshConfig) -> Result<Self> {
        let name = mesh.metadata.name.clone().ok_or_else(|| Error::invariant("WorkerMesh without metadata.name"))?;
        let namespace = mesh.namespace().ok_or_else(|| Error::invariant(format!("WorkerMesh {name} without namespace")))?;
        let labels = mesh_labels(&name, cfg);
        let svc_name = service_name(&name, cfg);
        let service = ServiceTarget {
            key: ObjectKey::new(&namespace, &svc_name),
            labels: labels.clone(),
            selector: labels.clone(),
            port_name: cfg.port_name.clone(),
            port: effective_port(mesh.spec.port, cfg.default_port),
        };
        let stateful_set = StatefulSetTarget {
            key: ObjectKey::new(&namespace, &name),
            labels: labels.clone(),
            replicas: mesh.spec.replicas,
            service_name: svc_name,
            pod_spec: mesh.spec.pod_template.clone(),
            pod_spec_hash: pod_spec_hash(&mesh.spec.pod_template)?,
        };
        let targets = Self { labels, service, stateful_set };
        targets.verify()?;
        Ok(targets)
    }

    /// Label, selector and template labels must all be the same set.
    pub fn verify(&self) -> Result<()> {
        let expected = &self.labels;
        if expected.len() != 2 {
            return Err(Error::invariant(format!("expected 2 mesh labels, got {}", expected.len())));
        }
        for (what, set) in [
            ("service labels", &self.service.labels),
            ("service selector", &self.service.selector),
            ("statefulset labels", &self.stateful_set.labels),
        ] {
            if set != expected {
                return Err(Error::invariant(format!("{what} {set:?} differ from mesh labels {expected:?}")));
            }
        }
        if self.stateful_set.service_name != self.service.key.name {
            return Err(Error::invariant(format!(
                "statefulset serviceName {} does not match service {}",
                self.stateful_set.service_name, self.service.key.name
            )));
        }
        Ok(())
    }
}

fn merge_labels(meta: &mut ObjectMeta, labels: &Labels) {
    let current = meta.labels.get_or_insert_with(BTreeMap::new);
    current.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
}

impl ServiceTarget {
    /// Merge the target into `svc` in place. Fields other actors may own
    /// (extra labels, annotations, server-assigned values) are left alone.
    pub fn apply(&self, svc: &mut Service) {
        merge_labels(&mut svc.metadata, &self.labels);
        let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
        spec.cluster_ip = Some(HEADLESS_CLUSTER_IP.to_string());
        spec.selector = Some(self.selector.clone());
        let mut port = spec
            .ports
            .take()
            .unwrap_or_default()
            .into_iter()
            .find(|p| p.name.as_deref() == Some(self.port_name.as_str()))
            .unwrap_or_default();
        port.name = Some(self.port_name.clone());
        port.port = self.port;
        port.target_port = Some(IntOrString::Int(self.port));
        port.protocol = Some(TCP.to_string());
        spec.ports = Some(vec![port]);
    }
}

impl StatefulSetTarget {
    /// Rewrites the pod spec only when `podTemplate` changed since the last
    /// write. Server-defaulted fields and out-of-band template edits are kept
    /// until then.
    pub fn apply(&self, sts: &mut StatefulSet) {
        merge_labels(&mut sts.metadata, &self.labels);
        let applied = sts.annotations().get(POD_TEMPLATE_HASH_ANNOTATION) == Some(&self.pod_spec_hash);
        let spec = sts.spec.get_or_insert_with(StatefulSetSpec::default);
        spec.replicas = Some(self.replicas);
        spec.service_name = self.service_name.clone();
        spec.selector = LabelSelector { match_labels: Some(self.labels.clone()), match_expressions: None };
        spec.pod_management_policy = Some(PARALLEL_POD_MANAGEMENT.to_string());
        let fresh = apply_template(&mut spec.template, &self.labels, &self.pod_spec, applied);
        if fresh {
            sts.annotations_mut().insert(POD_TEMPLATE_HASH_ANNOTATION.to_string(), self.pod_spec_hash.clone());
        }
    }
}

/// Returns true when the pod spec was (re)written.
fn apply_template(template: &mut PodTemplateSpec, labels: &Labels, pod_spec: &PodSpec, applied: bool) -> bool {
    // Mesh labels win over keys already present on the template.
    merge_labels(template.metadata.get_or_insert_with(ObjectMeta::default), labels);
    if applied && template.spec.is_some() {
        return false;
    }
    template.spec = Some(pod_spec.clone());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mesh;
    use k8s_openapi::api::core::v1::{Container, ServicePort};
    use proptest::prelude::*;

    fn cfg() -> MeshConfig { MeshConfig::default() }

    #[test]
    fn labels_are_shared_across_targets() {
        let t = MeshTargets::compute(&mesh("trainer", 3, 0), &cfg()).unwrap();
        assert_eq!(t.labels.get("aether.dev/mesh-name").map(String::as_str), Some("trainer"));
        assert_eq!(t.labels.get("app.kubernetes.io/name").map(String::as_str), Some("aether-worker"));
        assert_eq!(t.service.selector, t.labels);
        assert_eq!(t.stateful_set.labels, t.labels);
        assert_eq!(t.service.key, ObjectKey::new("default", "trainer-svc"));
        assert_eq!(t.stateful_set.key, ObjectKey::new("default", "trainer"));
        assert_eq!(t.stateful_set.service_name, "trainer-svc");
    }

    #[test]
    fn replicas_pass_through_verbatim() {
        for replicas in [0, 1, 5, -2] {
            let t = MeshTargets::compute(&mesh("m", replicas, 0), &cfg()).unwrap();
            assert_eq!(t.stateful_set.replicas, replicas);
        }
    }

    #[test]
    fn missing_namespace_is_invariant() {
        let mut m = mesh("m", 1, 0);
        m.metadata.namespace = None;
        assert!(matches!(MeshTargets::compute(&m, &cfg()), Err(Error::Invariant(_))));
    }

    #[test]
    fn verify_detects_selector_drift() {
        let mut t = MeshTargets::compute(&mesh("m", 1, 0), &cfg()).unwrap();
        t.service.selector.insert("extra".into(), "x".into());
        assert!(matches!(t.verify(), Err(Error::Invariant(_))));
    }

    #[test]
    fn service_apply_is_headless_with_single_port() {
        let t = MeshTargets::compute(&mesh("m", 3, 0), &cfg()).unwrap();
        let mut svc = Service::default();
        t.service.apply(&mut svc);
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        let ports = spec.ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("mesh"));
        assert_eq!(ports[0].port, 26600);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(26600)));
        let once = svc.clone();
        t.service.apply(&mut svc);
        assert_eq!(svc, once, "second apply must not change the object");
    }

    #[test]
    fn service_apply_keeps_foreign_labels_and_drops_stale_ports() {
        let t = MeshTargets::compute(&mesh("m", 1, 7000), &cfg()).unwrap();
        let mut svc = Service::default();
        svc.metadata.labels = Some(BTreeMap::from([("team".to_string(), "ml".to_string())]));
        svc.spec = Some(ServiceSpec {
            ports: Some(vec![
                ServicePort { name: Some("mesh".into()), port: 26600, ..Default::default() },
                ServicePort { name: Some("debug".into()), port: 9999, ..Default::default() },
            ]),
            ..Default::default()
        });
        t.service.apply(&mut svc);
        assert_eq!(svc.labels().get("team").map(String::as_str), Some("ml"));
        let ports = svc.spec.unwrap().ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 7000);
    }

    #[test]
    fn stateful_set_apply_sets_parallel_policy_and_template() {
        let mut m = mesh("m", 4, 0);
        m.spec.pod_template.containers = vec![Container { name: "worker".into(), image: Some("x".into()), ..Default::default() }];
        let t = MeshTargets::compute(&m, &cfg()).unwrap();
        let mut sts = StatefulSet::default();
        sts.spec = Some(StatefulSetSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(BTreeMap::from([
                        ("aether.dev/mesh-name".to_string(), "other".to_string()),
                        ("sidecar".to_string(), "on".to_string()),
                    ])),
                    ..Default::default()
                }),
                spec: None,
            },
            ..Default::default()
        });
        t.stateful_set.apply(&mut sts);
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(4));
        assert_eq!(spec.pod_management_policy.as_deref(), Some("Parallel"));
        assert_eq!(spec.service_name.as_str(), "m-svc");
        assert_eq!(spec.selector.match_labels.as_ref(), Some(&t.labels));
        let tmpl_labels = spec.template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(tmpl_labels.get("aether.dev/mesh-name").map(String::as_str), Some("m"));
        assert_eq!(tmpl_labels.get("sidecar").map(String::as_str), Some("on"));
        assert_eq!(spec.template.spec.as_ref().unwrap().containers[0].name, "worker");
    }

    #[test]
    fn server_defaults_in_pod_template_are_left_alone() {
        let mut m = mesh("m", 2, 0);
        m.spec.pod_template.containers = vec![Container { name: "worker".into(), image: Some("x".into()), ..Default::default() }];
        let t = MeshTargets::compute(&m, &cfg()).unwrap();
        let mut sts = StatefulSet::default();
        t.stateful_set.apply(&mut sts);
        assert_eq!(sts.annotations().get(POD_TEMPLATE_HASH_ANNOTATION), Some(&t.stateful_set.pod_spec_hash));

        let pod = sts.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        pod.restart_policy = Some("Always".into());
        pod.dns_policy = Some("ClusterFirst".into());
        let defaulted = sts.clone();
        t.stateful_set.apply(&mut sts);
        assert_eq!(sts, defaulted);

        m.spec.pod_template.containers[0].image = Some("y".into());
        let t = MeshTargets::compute(&m, &cfg()).unwrap();
        t.stateful_set.apply(&mut sts);
        let pod = sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("y"));
        assert!(pod.restart_policy.is_none());
        assert_eq!(sts.annotations().get(POD_TEMPLATE_HASH_ANNOTATION), Some(&t.stateful_set.pod_spec_hash));
    }

    #[test]
    fn pod_spec_hash_tracks_content() {
        let a = PodSpec::default();
        let mut b = PodSpec::default();
        assert_eq!(pod_spec_hash(&a).unwrap(), pod_spec_hash(&b).unwrap());
        b.hostname = Some("h".into());
        assert_ne!(pod_spec_hash(&a).unwrap(), pod_spec_hash(&b).unwrap());
        assert_eq!(pod_spec_hash(&a).unwrap().len(), 64);
    }

    proptest! {
        #[test]
        fn port_defaulting(port in any::<i32>(), default in 1..65535i32) {
            let got = effective_port(port, default);
            if port == 0 { prop_assert_eq!(got, default); } else { prop_assert_eq!(got, port); }
        }
    }
}
