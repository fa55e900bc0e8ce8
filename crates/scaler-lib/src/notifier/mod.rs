//! Resize outcome notifications
//!
//! Delivery is best-effort: one attempt plus a single retry when the
//! transport reports a transient failure. Permanent failures are logged
//! and counted, never propagated to fail the resize itself.

mod transport;

pub use transport::{LogTransport, WebhookTransport};

use crate::error::TransportError;
use crate::health::{components, HealthRegistry};
use crate::models::{OutcomeStatus, ResizeOutcome};
use crate::observability::ScalerMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use async_trait::async_trait;

/// Delay before the single retry on a transient failure
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Rendered notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub subject: String,
    pub body: String,
}

impl NotificationMessage {
    /// Render a message describing a resize outcome
    pub fn from_outcome(outcome: &ResizeOutcome) -> Self {
        let from = outcome.previous_size_class.as_deref().unwrap_or("unknown");
        match &outcome.status {
            OutcomeStatus::Succeeded => Self {
                subject: format!("Resize succeeded: {}", outcome.instance_id),
                body: format!(
                    "Instance {} was resized from {} to {} in {:.1}s (schedule {}).",
                    outcome.instance_id,
                    from,
                    outcome.target_size_class,
                    outcome.duration_ms as f64 / 1000.0,
                    outcome.schedule_id
                ),
            },
            OutcomeStatus::Failed { reason } => {
                let phase = outcome
                    .failed_phase
                    .map(|p| format!(" during {}", p))
                    .unwrap_or_default();
                let guidance = if outcome.failed_phase.map(|p| p.is_past_modify()).unwrap_or(false) {
                    " The instance was left in its current state and needs manual attention."
                } else {
                    " The instance was not modified."
                };
                Self {
                    subject: format!("Resize FAILED: {}", outcome.instance_id),
                    body: format!(
                        "Resize of instance {} from {} to {} failed{}: {}.{} (schedule {}, {:.1}s)",
                        outcome.instance_id,
                        from,
                        outcome.target_size_class,
                        phase,
                        reason,
                        guidance,
                        outcome.schedule_id,
                        outcome.duration_ms as f64 / 1000.0
                    ),
                }
            }
        }
    }
}

/// Delivery mechanism for notifications
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn publish(
        &self,
        channel: &str,
        message: &NotificationMessage,
    ) -> Result<(), TransportError>;
}

/// Best-effort outcome notifier
#[derive(Clone)]
pub struct Notifier {
    transport: Arc<dyn NotificationTransport>,
    metrics: Option<ScalerMetrics>,
    health: Option<HealthRegistry>,
    retry_delay: Duration,
}

impl Notifier {
    pub fn new(transport: Arc<dyn NotificationTransport>) -> Self {
        Self {
            transport,
            metrics: None,
            health: None,
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_metrics(mut self, metrics: ScalerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Report delivery failures as a degraded notifier
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Override the delay before the transient retry
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Deliver one outcome. Never fails; returns whether it was delivered.
    pub async fn notify(&self, channel: &str, outcome: &ResizeOutcome) -> bool {
        let message = NotificationMessage::from_outcome(outcome);

        let result = match self.transport.publish(channel, &message).await {
            Err(TransportError::Transient(reason)) => {
                warn!(
                    channel = %channel,
                    instance_id = %outcome.instance_id,
                    error = %reason,
                    "Transient notification failure, retrying once"
                );
                tokio::time::sleep(self.retry_delay).await;
                self.transport.publish(channel, &message).await
            }
            other => other,
        };

        match result {
            Ok(()) => {
                info!(
                    channel = %channel,
                    instance_id = %outcome.instance_id,
                    status = outcome.status.label(),
                    "Resize notification delivered"
                );
                if let Some(ref health) = self.health {
                    health.set_healthy(components::NOTIFIER).await;
                }
                true
            }
            Err(e) => {
                warn!(
                    event = "notification_failed",
                    channel = %channel,
                    instance_id = %outcome.instance_id,
                    error = %e,
                    "Resize notification dropped"
                );
                if let Some(ref metrics) = self.metrics {
                    metrics.inc_notification_failures();
                }
                if let Some(ref health) = self.health {
                    health
                        .set_degraded(
                            components::NOTIFIER,
                            format!("delivery to {} failed: {}", channel, e),
                        )
                        .await;
                }
                false
            }
        }
    }
}
