//! Scan execution seam
//!
//! The scheduler decides which image to scan, where and in which mode. The
//! executor behind [`ScanExecutor`] runs the scan job with those parameters
//! and reports success or a classified failure.

use crate::error::ScanFailure;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How the scan job reads the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Read layers from the node's container storage
    HostFs,
    /// Pull the image from its registry
    Remote,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::HostFs => write!(f, "hostfs"),
            ScanMode::Remote => write!(f, "remote"),
        }
    }
}

/// Container runtime that materialized the image on the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Docker,
    Containerd,
}

impl ContainerRuntime {
    /// Infer the runtime from a `<runtime>://<id>` container ID
    pub fn from_container_id(container_id: &str) -> Option<Self> {
        let (runtime, rest) = container_id.split_once("://")?;
        if rest.contains("://") {
            return None;
        }
        match runtime {
            "docker" => Some(ContainerRuntime::Docker),
            "containerd" => Some(ContainerRuntime::Containerd),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerRuntime::Docker => write!(f, "docker"),
            ContainerRuntime::Containerd => write!(f, "containerd"),
        }
    }
}

/// Image the scan job runs with (the agent's own image)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentImage {
    pub image: String,
    pub pull_secrets: Vec<String>,
}

/// What the executor does once the scan job has been started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionPolicy {
    pub wait_for_completion: bool,
    pub delete_finished_job: bool,
    pub wait_after_completion: Duration,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self {
            wait_for_completion: true,
            delete_finished_job: true,
            wait_after_completion: Duration::from_secs(30),
        }
    }
}

/// Placed scan request
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub image_name: String,
    pub image_id: String,
    pub container_runtime: Option<ContainerRuntime>,
    pub mode: ScanMode,
    pub resource_ids: Vec<String>,
    pub node_name: String,
    pub architecture: String,
    pub os: String,
    pub agent_image: AgentImage,
    pub completion: CompletionPolicy,
}

/// Runs and monitors scan jobs
#[async_trait]
pub trait ScanExecutor: Send + Sync {
    /// Run one scan to completion
    async fn scan_image(&self, request: ScanRequest) -> Result<(), ScanFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_from_container_id() {
        assert_eq!(
            ContainerRuntime::from_container_id("containerd://0a1b2c"),
            Some(ContainerRuntime::Containerd)
        );
        assert_eq!(
            ContainerRuntime::from_container_id("docker://0a1b2c"),
            Some(ContainerRuntime::Docker)
        );
        assert_eq!(ContainerRuntime::from_container_id("cri-o://0a1b2c"), None);
        assert_eq!(ContainerRuntime::from_container_id("0a1b2c"), None);
        assert_eq!(ContainerRuntime::from_container_id("a://b://c"), None);
    }

    #[test]
    fn test_scan_mode_serde() {
        assert_eq!(serde_json::to_string(&ScanMode::HostFs).unwrap(), "\"hostfs\"");
        let mode: ScanMode = serde_json::from_str("\"remote\"").unwrap();
        assert_eq!(mode, ScanMode::Remote);
        assert_eq!(ScanMode::HostFs.to_string(), "hostfs");
    }

    #[test]
    fn test_default_completion_policy() {
        let policy = CompletionPolicy::default();
        assert!(policy.wait_for_completion);
        assert!(policy.delete_finished_job);
        assert_eq!(policy.wait_after_completion, Duration::from_secs(30));
    }
}
