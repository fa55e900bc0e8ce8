//! Per-component health of the control loop
//!
//! Each stage reports into a shared [`HealthRegistry`]; `/healthz` exposes
//! the worst reported status and `/readyz` additionally requires start-up to
//! have finished.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Component names reported into the registry
pub mod components {
    /// Scale checks: metric reads and sizing decisions
    pub const EVALUATOR: &str = "evaluator";
    /// Schedule submission: platform lookups and store upserts
    pub const SCHEDULER: &str = "scheduler";
    pub const EXECUTOR: &str = "executor";
    /// Outcome delivery to the notification transport
    pub const NOTIFIER: &str = "notifier";
    pub const STORE: &str = "store";

    pub const ALL: [&str; 5] = [EVALUATOR, SCHEDULER, EXECUTOR, NOTIFIER, STORE];
}

/// Ordered from best to worst, so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Recent operations failed but the component keeps serving
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
    /// Last failure, absent while healthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix seconds of the last report
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn reported(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    fn from_components(components: BTreeMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        Self { status, components }
    }

    fn unhealthy_components(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, health)| health.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct Snapshot {
    components: BTreeMap<String, ComponentHealth>,
    started: bool,
}

/// Shared between the control loop tasks and the HTTP handlers
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Snapshot>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `name` as healthy
    pub async fn register(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    async fn set(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        self.inner
            .write()
            .await
            .components
            .insert(name.to_string(), ComponentHealth::reported(status, message));
    }

    /// Flip once the background loops and the listener are up
    pub async fn set_ready(&self, ready: bool) {
        self.inner.write().await.started = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.inner.read().await.components.clone();
        HealthResponse::from_components(components)
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let (started, health) = {
            let snapshot = self.inner.read().await;
            (
                snapshot.started,
                HealthResponse::from_components(snapshot.components.clone()),
            )
        };

        let reason = if !started {
            Some("agent is still starting".to_string())
        } else {
            let unhealthy = health.unhealthy_components();
            (!unhealthy.is_empty()).then(|| format!("unhealthy: {}", unhealthy.join(", ")))
        };
        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy_but_not_ready() {
        let registry = HealthRegistry::new();

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("agent is still starting"));
    }

    #[tokio::test]
    async fn test_every_component_registers_healthy() {
        let registry = HealthRegistry::new();
        for name in components::ALL {
            registry.register(name).await;
        }

        let health = registry.health().await;
        assert_eq!(health.components.len(), components::ALL.len());
        assert!(health
            .components
            .values()
            .all(|c| c.status == ComponentStatus::Healthy && c.message.is_none()));
    }

    #[tokio::test]
    async fn test_worst_status_wins() {
        let registry = HealthRegistry::new();
        for name in components::ALL {
            registry.register(name).await;
        }

        registry
            .set_degraded(components::NOTIFIER, "webhook returned 400")
            .await;
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert!(health.status.is_operational());

        registry
            .set_unhealthy(components::STORE, "database unavailable")
            .await;
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert!(!health.status.is_operational());
    }

    #[tokio::test]
    async fn test_recovery_clears_message() {
        let registry = HealthRegistry::new();
        registry
            .set_degraded(components::SCHEDULER, "describe_instance throttled")
            .await;
        registry.set_healthy(components::SCHEDULER).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components[components::SCHEDULER].message.is_none());
    }

    #[tokio::test]
    async fn test_readiness_names_unhealthy_components() {
        let registry = HealthRegistry::new();
        registry.register(components::STORE).await;
        registry.register(components::EXECUTOR).await;
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry
            .set_degraded(components::EXECUTOR, "claim failed")
            .await;
        assert!(registry.readiness().await.ready);

        registry
            .set_unhealthy(components::STORE, "database unavailable")
            .await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("unhealthy: store"));
    }
}
