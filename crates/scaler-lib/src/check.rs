//! Timer-driven scale check
//!
//! One pass of the control loop for one managed instance: read the current
//! class, read a utilization sample, evaluate, and schedule any resize for
//! the instance's next maintenance window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CheckError, EvaluationError};
use crate::evaluator::{evaluate, read_sample, MetricsSource};
use crate::health::{components, HealthRegistry};
use crate::models::{ManagedInstance, MetricSample, ScheduleSource, SizingDecision};
use crate::observability::{ScalerMetrics, StructuredLogger};
use crate::platform::ComputePlatform;
use crate::scheduler::ResizeScheduler;

/// Result of one check
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub instance_id: String,
    pub current_size_class: String,
    pub sample: MetricSample,
    pub decision: SizingDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<DateTime<FixedOffset>>,
}

#[derive(Clone)]
pub struct ScaleCheck {
    platform: Arc<dyn ComputePlatform>,
    source: Arc<dyn MetricsSource>,
    scheduler: ResizeScheduler,
    min_lead: chrono::Duration,
    logger: StructuredLogger,
    metrics: Option<ScalerMetrics>,
    health: Option<HealthRegistry>,
}

impl ScaleCheck {
    pub fn new(
        platform: Arc<dyn ComputePlatform>,
        source: Arc<dyn MetricsSource>,
        scheduler: ResizeScheduler,
    ) -> Self {
        Self {
            platform,
            source,
            scheduler,
            min_lead: chrono::Duration::minutes(5),
            logger: StructuredLogger::new("evaluator"),
            metrics: None,
            health: None,
        }
    }

    /// Minimum distance between the check and the scheduled window
    pub fn with_min_lead(mut self, min_lead: chrono::Duration) -> Self {
        self.min_lead = min_lead;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics(mut self, metrics: ScalerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub async fn run(&self, instance: &ManagedInstance) -> Result<CheckReport, CheckError> {
        self.run_at(instance, Utc::now()).await
    }

    pub async fn run_at(
        &self,
        instance: &ManagedInstance,
        now: DateTime<Utc>,
    ) -> Result<CheckReport, CheckError> {
        let instance_id = instance.instance_id.as_str();
        let current = self.platform.describe_instance(instance_id).await?;

        let window = Duration::from_secs(instance.metric_window_secs);
        let sample = match read_sample(self.source.as_ref(), instance_id, window).await {
            Ok(sample) => sample,
            Err(e) => {
                self.record_failure(&e).await;
                return Err(e.into());
            }
        };

        let profile = instance.profile(current.size_class.clone());
        let decision = match evaluate(&profile, &sample) {
            Ok(decision) => decision,
            Err(e) => {
                self.record_failure(&e).await;
                return Err(e.into());
            }
        };

        if let Some(ref health) = self.health {
            health.set_healthy(components::EVALUATOR).await;
        }
        if let Some(ref metrics) = self.metrics {
            metrics.inc_evaluation(&decision);
        }
        self.logger.log_decision(
            instance_id,
            &current.size_class,
            sample.cpu_pct,
            sample.mem_pct,
            &decision,
        );

        let mut report = CheckReport {
            instance_id: instance_id.to_string(),
            current_size_class: current.size_class,
            sample,
            decision,
            schedule_id: None,
            execution_time: None,
        };

        let Some(target) = report.decision.target().map(str::to_string) else {
            debug!(instance_id = %instance_id, "No resize needed");
            return Ok(report);
        };

        let execution_time = instance.maintenance_window.next_after(now, self.min_lead);
        let schedule_id = self
            .scheduler
            .submit(
                instance_id,
                &target,
                execution_time,
                ScheduleSource::Evaluator,
                now,
            )
            .await?;

        report.schedule_id = Some(schedule_id);
        report.execution_time = Some(execution_time);
        Ok(report)
    }

    /// Check every instance on a fixed interval until shutdown.
    ///
    /// The first pass runs one interval after start.
    pub async fn run_periodic(
        self,
        instances: Vec<ManagedInstance>,
        every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            interval_secs = every.as_secs(),
            instances = instances.len(),
            "Starting scale check loop"
        );
        let mut ticker = interval_at(Instant::now() + every, every);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for instance in &instances {
                        if let Err(e) = self.run(instance).await {
                            warn!(
                                instance_id = %instance.instance_id,
                                error = %e,
                                "Scale check failed"
                            );
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down scale check loop");
                    break;
                }
            }
        }
    }

    async fn record_failure(&self, error: &EvaluationError) {
        if matches!(error, EvaluationError::MetricUnavailable { .. }) {
            if let Some(ref metrics) = self.metrics {
                metrics.inc_metric_unavailable();
            }
        }
        if let Some(ref health) = self.health {
            health
                .set_degraded(components::EVALUATOR, error.to_string())
                .await;
        }
    }
}
