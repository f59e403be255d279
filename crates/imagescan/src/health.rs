//! Health tracking for the scan scheduler
//!
//! The controller reports on three components: the scheduling pass itself,
//! calls to the remote authority and the cluster event queue. Liveness is
//! the worst component status. Readiness additionally waits for the
//! scheduler to leave its initial delay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operating, but the last attempt at its job failed
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failed updates in a row, reset by the next healthy update
    #[serde(default)]
    pub consecutive_failures: u32,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            consecutive_failures: u32::from(status != ComponentStatus::Healthy),
            updated_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components, healthy when none are registered
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const SCHEDULER: &str = "scheduler";
    pub const REMOTE_SYNC: &str = "remote_sync";
    pub const EVENT_QUEUE: &str = "event_queue";

    /// Every component the controller reports on
    pub const ALL: [&str; 3] = [SCHEDULER, REMOTE_SYNC, EVENT_QUEUE];
}

/// Shared registry of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register components as healthy
    pub async fn register_all(&self, names: &[&str]) {
        let mut components = self.components.write().await;
        for name in names {
            components.insert(name.to_string(), ComponentHealth::healthy());
        }
    }

    /// Record a new status, carrying the failure streak of the previous one
    pub async fn update(&self, name: &str, mut health: ComponentHealth) {
        let mut components = self.components.write().await;
        if health.status != ComponentStatus::Healthy {
            let previous = components.get(name).map_or(0, |c| c.consecutive_failures);
            health.consecutive_failures = previous.saturating_add(1);
        }
        components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.components.read().await.get(name).cloned()
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Ready once the initial delay is over and no component is unhealthy.
    /// The reason names the unhealthy components.
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("Scheduler still in initial delay".to_string()),
            };
        }

        let components = self.components.read().await;
        let mut unhealthy: Vec<String> = components
            .iter()
            .filter(|(_, c)| !c.status.is_operational())
            .map(|(name, c)| match &c.message {
                Some(message) => format!("{name}: {message}"),
                None => name.clone(),
            })
            .collect();
        unhealthy.sort();

        ReadinessResponse {
            ready: unhealthy.is_empty(),
            reason: (!unhealthy.is_empty())
                .then(|| format!("Unhealthy components: {}", unhealthy.join(", "))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
        assert!(!registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_remote_sync_failure_streak() {
        let registry = HealthRegistry::new();
        registry.register_all(&components::ALL).await;

        registry
            .set_degraded(components::REMOTE_SYNC, "sync_state: connection refused")
            .await;
        registry
            .set_degraded(components::REMOTE_SYNC, "status_report: timed out after 30s")
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        let remote = &health.components[components::REMOTE_SYNC];
        assert_eq!(remote.consecutive_failures, 2);
        assert_eq!(
            remote.message.as_deref(),
            Some("status_report: timed out after 30s")
        );

        registry.set_healthy(components::REMOTE_SYNC).await;
        let remote = registry.component(components::REMOTE_SYNC).await.unwrap();
        assert_eq!(remote.consecutive_failures, 0);
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_readiness_names_unhealthy_components() {
        let registry = HealthRegistry::new();
        registry.register_all(&components::ALL).await;
        registry.set_ready(true).await;
        registry
            .set_degraded(components::SCHEDULER, "agent image not found")
            .await;

        // Degraded still serves
        assert!(registry.readiness().await.ready);

        registry
            .set_unhealthy(components::EVENT_QUEUE, "all event producers dropped")
            .await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Unhealthy components: event_queue: all event producers dropped")
        );
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }
}
