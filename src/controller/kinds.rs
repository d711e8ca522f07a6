//! Generic reconciler parameterization across resource kinds (spec §9
//! "Polymorphism across resource kinds"). A single `WorkloadKind` impl
//! per kind supplies the pod-template accessor and the patch document
//! shape; the reconcile/patch-tick logic in `super` never branches on
//! kind.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::Container;
use serde_json::{Value, json};

/// `{name, image}` — the only fields a strategic-merge container patch
/// carries (spec §4.5 step 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImagePatch {
    pub name: String,
    pub image: String,
}

impl ContainerImagePatch {
    fn to_json(&self) -> Value {
        json!({ "name": self.name, "image": self.image })
    }
}

fn containers_json(containers: &[ContainerImagePatch]) -> Option<Value> {
    if containers.is_empty() {
        None
    } else {
        Some(Value::Array(containers.iter().map(ContainerImagePatch::to_json).collect()))
    }
}

/// One Kubernetes workload kind the reconciler knows how to drive: where
/// to read containers from, and the shape of the strategic-merge patch
/// that updates them.
pub trait WorkloadKind: Clone + Send + Sync + 'static {
    /// Static label used in logs, metrics, and the resource-key string's
    /// implicit namespace (the kind itself isn't part of the key; this is
    /// purely for observability).
    const KIND_NAME: &'static str;

    fn containers(&self) -> &[Container];
    fn init_containers(&self) -> &[Container];

    /// Builds the strategic-merge patch document for the given container
    /// and init-container updates. Both lists are assumed non-empty (spec
    /// §4.5 step 5: an all-empty update is a no-op handled by the caller).
    fn build_patch(containers: Vec<ContainerImagePatch>, init_containers: Vec<ContainerImagePatch>) -> Value;
}

macro_rules! impl_pod_template_kind {
    ($ty:ty, $name:literal) => {
        impl WorkloadKind for $ty {
            const KIND_NAME: &'static str = $name;

            fn containers(&self) -> &[Container] {
                self.spec
                    .as_ref()
                    .and_then(|s| s.template.spec.as_ref())
                    .map(|s| s.containers.as_slice())
                    .unwrap_or(&[])
            }

            fn init_containers(&self) -> &[Container] {
                self.spec
                    .as_ref()
                    .and_then(|s| s.template.spec.as_ref())
                    .and_then(|s| s.init_containers.as_deref())
                    .unwrap_or(&[])
            }

            fn build_patch(containers: Vec<ContainerImagePatch>, init_containers: Vec<ContainerImagePatch>) -> Value {
                let mut pod_spec = serde_json::Map::new();
                if let Some(c) = containers_json(&containers) {
                    pod_spec.insert("containers".to_string(), c);
                }
                if let Some(c) = containers_json(&init_containers) {
                    pod_spec.insert("initContainers".to_string(), c);
                }
                json!({ "spec": { "template": { "spec": Value::Object(pod_spec) } } })
            }
        }
    };
}

impl_pod_template_kind!(Deployment, "deployment");
impl_pod_template_kind!(StatefulSet, "statefulset");
impl_pod_template_kind!(DaemonSet, "daemonset");

impl WorkloadKind for CronJob {
    const KIND_NAME: &'static str = "cronjob";

    fn containers(&self) -> &[Container] {
        self.spec
            .as_ref()
            .and_then(|s| s.job_template.spec.as_ref())
            .and_then(|s| s.template.spec.as_ref())
            .map(|s| s.containers.as_slice())
            .unwrap_or(&[])
    }

    fn init_containers(&self) -> &[Container] {
        self.spec
            .as_ref()
            .and_then(|s| s.job_template.spec.as_ref())
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.init_containers.as_deref())
            .unwrap_or(&[])
    }

    fn build_patch(containers: Vec<ContainerImagePatch>, init_containers: Vec<ContainerImagePatch>) -> Value {
        let mut pod_spec = serde_json::Map::new();
        if let Some(c) = containers_json(&containers) {
            pod_spec.insert("containers".to_string(), c);
        }
        if let Some(c) = containers_json(&init_containers) {
            pod_spec.insert("initContainers".to_string(), c);
        }
        json!({
            "spec": {
                "jobTemplate": {
                    "spec": {
                        "template": { "spec": Value::Object(pod_spec) }
                    }
                }
            }
        })
    }
}
