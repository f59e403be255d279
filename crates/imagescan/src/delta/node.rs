//! Node capacity tracking

use crate::quantity::Quantity;
use k8s_openapi::api::core::v1::{Node as K8sNode, PodSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

const LABEL_OS: &str = "kubernetes.io/os";
const LABEL_ARCH: &str = "kubernetes.io/arch";

/// Resources reserved by one pod
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodRequests {
    pub cpu: Quantity,
    pub memory: Quantity,
}

impl PodRequests {
    /// Sum of the regular containers' requests
    pub fn from_spec(spec: &PodSpec) -> Self {
        let mut requests = PodRequests::default();
        for container in &spec.containers {
            let Some(container_requests) = container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
            else {
                continue;
            };
            requests.cpu += parse_resource(container_requests.get("cpu"), "cpu");
            requests.memory += parse_resource(container_requests.get("memory"), "memory");
        }
        requests
    }
}

/// A cluster node and the pods scheduled on it
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub name: String,
    pub architecture: String,
    pub os: String,
    pub labels: BTreeMap<String, String>,
    pub allocatable_cpu: Quantity,
    pub allocatable_memory: Quantity,
    /// Pod ID -> reserved resources
    pub pods: HashMap<String, PodRequests>,
}

impl Node {
    /// Placeholder for a node only known from pod events so far
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Refresh allocatable resources, platform and labels from the node object
    pub fn update_from(&mut self, node: &K8sNode) {
        self.labels = node.metadata.labels.clone().unwrap_or_default();

        let status = node.status.as_ref();
        let info = status.and_then(|s| s.node_info.as_ref());
        self.architecture = info
            .map(|i| i.architecture.clone())
            .filter(|a| !a.is_empty())
            .or_else(|| self.labels.get(LABEL_ARCH).cloned())
            .unwrap_or_default();
        self.os = info
            .map(|i| i.operating_system.clone())
            .filter(|os| !os.is_empty())
            .or_else(|| self.labels.get(LABEL_OS).cloned())
            .unwrap_or_default();

        let allocatable = status.and_then(|s| s.allocatable.as_ref());
        self.allocatable_cpu = parse_resource(allocatable.and_then(|a| a.get("cpu")), "cpu");
        self.allocatable_memory =
            parse_resource(allocatable.and_then(|a| a.get("memory")), "memory");
    }

    /// Allocatable CPU minus pod requests. Not clamped at zero.
    pub fn available_cpu(&self) -> Quantity {
        self.allocatable_cpu - self.pods.values().map(|p| p.cpu).sum::<Quantity>()
    }

    /// Allocatable memory minus pod requests. Not clamped at zero.
    pub fn available_memory(&self) -> Quantity {
        self.allocatable_memory - self.pods.values().map(|p| p.memory).sum::<Quantity>()
    }

    pub fn fits(&self, memory: Quantity, cpu: Quantity) -> bool {
        self.available_memory() >= memory && self.available_cpu() >= cpu
    }

    pub fn is_linux(&self) -> bool {
        self.os == "linux"
    }

    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).is_some_and(|v| v == value)
    }
}

fn parse_resource(value: Option<&K8sQuantity>, resource: &str) -> Quantity {
    let Some(value) = value else {
        return Quantity::ZERO;
    };
    match Quantity::try_from(value) {
        Ok(q) => q,
        Err(e) => {
            warn!(resource = %resource, value = %value.0, error = %e, "Ignoring unparsable quantity");
            Quantity::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, NodeStatus, NodeSystemInfo, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    fn container(cpu: &str, memory: &str) -> Container {
        Container {
            name: "c".to_string(),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([
                    ("cpu".to_string(), K8sQuantity(cpu.to_string())),
                    ("memory".to_string(), K8sQuantity(memory.to_string())),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_requests_sum_containers() {
        let spec = PodSpec {
            containers: vec![container("250m", "64Mi"), container("1", "1Gi")],
            init_containers: Some(vec![container("4", "4Gi")]),
            ..Default::default()
        };
        let requests = PodRequests::from_spec(&spec);
        assert_eq!(requests.cpu, q("1250m"));
        assert_eq!(requests.memory, q("64Mi") + q("1Gi"));
    }

    #[test]
    fn test_pod_requests_skip_invalid() {
        let spec = PodSpec {
            containers: vec![container("bogus", "1Gi"), Container::default()],
            ..Default::default()
        };
        let requests = PodRequests::from_spec(&spec);
        assert_eq!(requests.cpu, Quantity::ZERO);
        assert_eq!(requests.memory, q("1Gi"));
    }

    #[test]
    fn test_update_from_node_object() {
        let k8s_node = K8sNode {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                labels: Some(BTreeMap::from([("pool".to_string(), "scan".to_string())])),
                ..Default::default()
            },
            status: Some(NodeStatus {
                allocatable: Some(BTreeMap::from([
                    ("cpu".to_string(), K8sQuantity("4".to_string())),
                    ("memory".to_string(), K8sQuantity("16Gi".to_string())),
                ])),
                node_info: Some(NodeSystemInfo {
                    architecture: "arm64".to_string(),
                    operating_system: "linux".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut node = Node::new("n1");
        node.update_from(&k8s_node);
        assert_eq!(node.architecture, "arm64");
        assert!(node.is_linux());
        assert!(node.has_label("pool", "scan"));
        assert_eq!(node.allocatable_cpu, q("4"));
        assert_eq!(node.allocatable_memory, q("16Gi"));
    }

    #[test]
    fn test_platform_from_labels_when_node_info_missing() {
        let k8s_node = K8sNode {
            metadata: ObjectMeta {
                labels: Some(BTreeMap::from([
                    (LABEL_OS.to_string(), "windows".to_string()),
                    (LABEL_ARCH.to_string(), "amd64".to_string()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut node = Node::new("win");
        node.update_from(&k8s_node);
        assert_eq!(node.os, "windows");
        assert_eq!(node.architecture, "amd64");
        assert!(!node.is_linux());
    }

    #[test]
    fn test_available_resources_can_go_negative() {
        let mut node = Node::new("n1");
        node.allocatable_cpu = q("1");
        node.allocatable_memory = q("1Gi");
        node.pods.insert(
            "p1".to_string(),
            PodRequests {
                cpu: q("1500m"),
                memory: q("512Mi"),
            },
        );

        assert!(node.available_cpu().is_negative());
        assert_eq!(node.available_memory(), q("512Mi"));
        assert!(!node.fits(q("1Mi"), q("1m")));
        assert!(node.fits(q("512Mi"), Quantity::ZERO - q("500m")));
    }
}
