//! Cluster object builders shared by unit tests

use crate::events::ClusterObject;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, LocalObjectReference, Node as K8sNode, NodeSpec, NodeStatus,
    NodeSystemInfo, Pod, PodSpec, PodStatus, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeMap;

pub fn resources(cpu: &str, memory: &str) -> BTreeMap<String, K8sQuantity> {
    BTreeMap::from([
        ("cpu".to_string(), K8sQuantity(cpu.to_string())),
        ("memory".to_string(), K8sQuantity(memory.to_string())),
    ])
}

pub fn owner_ref(kind: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: kind.to_string(),
        name: format!("{uid}-name"),
        uid: uid.to_string(),
        controller: Some(true),
        ..Default::default()
    }
}

/// Builder for pods carrying image statuses
pub struct PodBuilder {
    pod: Pod,
}

impl PodBuilder {
    pub fn new(uid: &str) -> Self {
        Self {
            pod: Pod {
                metadata: ObjectMeta {
                    uid: Some(uid.to_string()),
                    name: Some(uid.to_string()),
                    namespace: Some("default".to_string()),
                    ..Default::default()
                },
                spec: Some(PodSpec::default()),
                status: Some(PodStatus {
                    phase: Some("Running".to_string()),
                    container_statuses: Some(Vec::new()),
                    ..Default::default()
                }),
            },
        }
    }

    pub fn node(mut self, node_name: &str) -> Self {
        if let Some(spec) = self.pod.spec.as_mut() {
            spec.node_name = Some(node_name.to_string());
        }
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        if let Some(status) = self.pod.status.as_mut() {
            status.phase = Some(phase.to_string());
        }
        self
    }

    pub fn owner(mut self, kind: &str, uid: &str) -> Self {
        self.pod.metadata.owner_references = Some(vec![owner_ref(kind, uid)]);
        self
    }

    /// Add a container whose status reports `image_id`
    pub fn container(mut self, name: &str, image: &str, image_id: &str) -> Self {
        self.push_container(name, image, image_id, None);
        self
    }

    pub fn container_with_requests(
        mut self,
        name: &str,
        image: &str,
        image_id: &str,
        cpu: &str,
        memory: &str,
    ) -> Self {
        self.push_container(name, image, image_id, Some(resources(cpu, memory)));
        self
    }

    pub fn init_container(mut self, name: &str, image: &str, image_id: &str) -> Self {
        if let Some(spec) = self.pod.spec.as_mut() {
            spec.init_containers.get_or_insert_with(Vec::new).push(Container {
                name: name.to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            });
        }
        if let Some(status) = self.pod.status.as_mut() {
            status
                .init_container_statuses
                .get_or_insert_with(Vec::new)
                .push(container_status(name, image_id));
        }
        self
    }

    fn push_container(
        &mut self,
        name: &str,
        image: &str,
        image_id: &str,
        requests: Option<BTreeMap<String, K8sQuantity>>,
    ) {
        if let Some(spec) = self.pod.spec.as_mut() {
            spec.containers.push(Container {
                name: name.to_string(),
                image: Some(image.to_string()),
                resources: requests.map(|requests| ResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        if let Some(status) = self.pod.status.as_mut() {
            status
                .container_statuses
                .get_or_insert_with(Vec::new)
                .push(container_status(name, image_id));
        }
    }

    pub fn object(self) -> ClusterObject {
        ClusterObject::Pod(self.pod)
    }
}

fn container_status(name: &str, image_id: &str) -> ContainerStatus {
    ContainerStatus {
        name: name.to_string(),
        image_id: image_id.to_string(),
        container_id: Some(format!("containerd://{name}")),
        ..Default::default()
    }
}

/// Linux node with the given allocatable resources
pub fn node(name: &str, architecture: &str, cpu: &str, memory: &str) -> K8sNode {
    node_with_labels(name, architecture, cpu, memory, &[])
}

pub fn node_with_labels(
    name: &str,
    architecture: &str,
    cpu: &str,
    memory: &str,
    labels: &[(&str, &str)],
) -> K8sNode {
    K8sNode {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: Some(NodeStatus {
            allocatable: Some(resources(cpu, memory)),
            node_info: Some(NodeSystemInfo {
                architecture: architecture.to_string(),
                operating_system: "linux".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

/// Deployment running the scan agent's own image
pub fn agent_deployment(namespace: &str, name: &str, container: &str, image: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            uid: Some(format!("{name}-uid")),
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: container.to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    }],
                    image_pull_secrets: Some(vec![LocalObjectReference {
                        name: Some("registry-creds".to_string()),
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
