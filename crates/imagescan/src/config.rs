//! Scheduler configuration

use crate::error::SchedulerError;
use crate::executor::ScanMode;
use crate::quantity::Quantity;
use anyhow::Result;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Upper bound for a single scan, whatever the configured timeout
pub const MAX_SCAN_TIMEOUT: Duration = Duration::from_secs(600);

/// Scan scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Cluster identifier attached to structured log events
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Default scan mode
    #[serde(default = "default_mode")]
    pub mode: ScanMode,

    /// Interval between scheduling passes
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Per scan timeout
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,

    #[serde(default = "default_max_concurrent_scans")]
    pub max_concurrent_scans: usize,

    /// Events are only applied, never scheduled on, during this window
    #[serde(default = "default_init_delay")]
    pub init_delay_secs: u64,

    /// CPU request of a scan job
    #[serde(default = "default_cpu_request")]
    pub cpu_request: String,

    /// Memory request of a scan job
    #[serde(default = "default_memory_request")]
    pub memory_request: String,

    /// Timeout of each remote authority call
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_secs: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Nodes carrying this label are eligible for host filesystem scans
    #[serde(default = "default_managed_node_label")]
    pub managed_node_label: String,

    #[serde(default = "default_managed_node_label_value")]
    pub managed_node_label_value: String,

    /// Deployment whose image runs the scan jobs
    #[serde(default = "default_agent_namespace")]
    pub agent_namespace: String,

    #[serde(default = "default_agent_deployment")]
    pub agent_deployment: String,

    #[serde(default = "default_agent_container")]
    pub agent_container: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_cluster_id() -> String {
    std::env::var("CLUSTER_ID").unwrap_or_else(|_| "unknown".to_string())
}

fn default_mode() -> ScanMode {
    ScanMode::HostFs
}

fn default_scan_interval() -> u64 {
    15
}

fn default_scan_timeout() -> u64 {
    600
}

fn default_max_concurrent_scans() -> usize {
    3
}

fn default_init_delay() -> u64 {
    60
}

fn default_cpu_request() -> String {
    "100m".to_string()
}

fn default_memory_request() -> String {
    "100Mi".to_string()
}

fn default_remote_timeout() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    crate::events::DEFAULT_QUEUE_CAPACITY
}

fn default_managed_node_label() -> String {
    "provisioner.cast.ai/managed-by".to_string()
}

fn default_managed_node_label_value() -> String {
    "cast.ai".to_string()
}

fn default_agent_namespace() -> String {
    "castai-agent".to_string()
}

fn default_agent_deployment() -> String {
    "castai-kvisor".to_string()
}

fn default_agent_container() -> String {
    "kvisor".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            cluster_id: default_cluster_id(),
            mode: default_mode(),
            scan_interval_secs: default_scan_interval(),
            scan_timeout_secs: default_scan_timeout(),
            max_concurrent_scans: default_max_concurrent_scans(),
            init_delay_secs: default_init_delay(),
            cpu_request: default_cpu_request(),
            memory_request: default_memory_request(),
            remote_timeout_secs: default_remote_timeout(),
            queue_capacity: default_queue_capacity(),
            managed_node_label: default_managed_node_label(),
            managed_node_label_value: default_managed_node_label_value(),
            agent_namespace: default_agent_namespace(),
            agent_deployment: default_agent_deployment(),
            agent_container: default_agent_container(),
            api_port: default_api_port(),
        }
    }
}

/// Parsed scan job resource requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanResources {
    pub cpu: Quantity,
    pub memory: Quantity,
}

impl ScanConfig {
    /// Load configuration from `IMAGE_SCAN_*` environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;
        Self::from_config(config)
    }

    /// Deserialize from an already built configuration
    pub fn from_config(config: config::Config) -> Result<Self> {
        Ok(config.try_deserialize()?)
    }

    /// Check the configuration and parse the scan job requests
    pub fn validate(&self) -> Result<ScanResources, SchedulerError> {
        let cpu = Quantity::parse(&self.cpu_request)
            .map_err(|e| SchedulerError::InvalidConfig(format!("cpu_request: {e}")))?;
        let memory = Quantity::parse(&self.memory_request)
            .map_err(|e| SchedulerError::InvalidConfig(format!("memory_request: {e}")))?;
        if cpu.is_negative() || memory.is_negative() {
            return Err(SchedulerError::InvalidConfig(
                "scan resource requests must not be negative".to_string(),
            ));
        }
        if self.max_concurrent_scans == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_concurrent_scans must be at least 1".to_string(),
            ));
        }
        if self.scan_interval_secs == 0 {
            return Err(SchedulerError::InvalidConfig(
                "scan_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(ScanResources { cpu, memory })
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Configured scan timeout, capped at [`MAX_SCAN_TIMEOUT`]
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs).min(MAX_SCAN_TIMEOUT)
    }

    pub fn init_delay(&self) -> Duration {
        Duration::from_secs(self.init_delay_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    /// Listen address for the health and metrics endpoints
    pub fn api_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.api_port))
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("IMAGE_SCAN")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
