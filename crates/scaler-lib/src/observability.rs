//! Observability infrastructure for the scaler
//!
//! Provides:
//! - Prometheus metrics (decisions, schedules, executions, notification failures)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{OutcomeStatus, ResizeOutcome, ResizePhase, SizingDecision};

/// Resize durations span minutes, not milliseconds
const RESIZE_DURATION_BUCKETS: &[f64] = &[5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<Result<ScalerMetricsInner, String>> = OnceLock::new();

struct ScalerMetricsInner {
    evaluations: IntCounterVec,
    metric_unavailable: IntCounter,
    schedules: IntCounterVec,
    executions: IntCounterVec,
    executions_skipped: IntCounter,
    resize_duration_seconds: Histogram,
    notification_failures: IntCounter,
    pending_schedules: IntGauge,
}

impl ScalerMetricsInner {
    fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            evaluations: register_int_counter_vec!(
                "vertical_scaler_evaluations_total",
                "Metric evaluations by resulting decision",
                &["decision"]
            )?,
            metric_unavailable: register_int_counter!(
                "vertical_scaler_metric_unavailable_total",
                "Evaluations aborted because no utilization metric could be read"
            )?,
            schedules: register_int_counter_vec!(
                "vertical_scaler_schedules_total",
                "Schedule store mutations by kind",
                &["kind"]
            )?,
            executions: register_int_counter_vec!(
                "vertical_scaler_executions_total",
                "Finished resize executions by status",
                &["status"]
            )?,
            executions_skipped: register_int_counter!(
                "vertical_scaler_executions_skipped_total",
                "Executor invocations that found nothing to do"
            )?,
            resize_duration_seconds: register_histogram!(
                "vertical_scaler_resize_duration_seconds",
                "Wall-clock duration of finished resize executions",
                RESIZE_DURATION_BUCKETS.to_vec()
            )?,
            notification_failures: register_int_counter!(
                "vertical_scaler_notification_failures_total",
                "Outcome notifications that could not be delivered"
            )?,
            pending_schedules: register_int_gauge!(
                "vertical_scaler_pending_schedules",
                "Pending resize schedules in the store"
            )?,
        })
    }
}

/// Scaler metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics. If registration
/// failed, every recording call is a no-op.
#[derive(Clone)]
pub struct ScalerMetrics {
    _private: (),
}

impl Default for ScalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        let inner =
            GLOBAL_METRICS.get_or_init(|| ScalerMetricsInner::new().map_err(|e| e.to_string()));
        if let Err(e) = inner {
            warn!(error = %e, "Prometheus metrics registration failed, metrics disabled");
        }
        Self { _private: () }
    }

    fn inner(&self) -> Option<&ScalerMetricsInner> {
        GLOBAL_METRICS.get().and_then(|inner| inner.as_ref().ok())
    }

    pub fn inc_evaluation(&self, decision: &SizingDecision) {
        if let Some(inner) = self.inner() {
            inner.evaluations.with_label_values(&[decision.label()]).inc();
        }
    }

    pub fn inc_metric_unavailable(&self) {
        if let Some(inner) = self.inner() {
            inner.metric_unavailable.inc();
        }
    }

    /// Count a schedule mutation: `created`, `replaced`, `stale` or `cancelled`
    pub fn inc_schedule(&self, kind: &str) {
        if let Some(inner) = self.inner() {
            inner.schedules.with_label_values(&[kind]).inc();
        }
    }

    pub fn record_execution(&self, outcome: &ResizeOutcome) {
        if let Some(inner) = self.inner() {
            inner
                .executions
                .with_label_values(&[outcome.status.label()])
                .inc();
            inner
                .resize_duration_seconds
                .observe(outcome.duration_ms as f64 / 1000.0);
        }
    }

    pub fn inc_execution_skipped(&self) {
        if let Some(inner) = self.inner() {
            inner.executions_skipped.inc();
        }
    }

    pub fn inc_notification_failures(&self) {
        if let Some(inner) = self.inner() {
            inner.notification_failures.inc();
        }
    }

    pub fn set_pending_schedules(&self, count: i64) {
        if let Some(inner) = self.inner() {
            inner.pending_schedules.set(count);
        }
    }
}

/// Structured logger for control-loop events
///
/// Emits one consistently shaped event per lifecycle step so that
/// decisions, schedules and resizes can be correlated in JSON logs.
#[derive(Clone)]
pub struct StructuredLogger {
    agent_name: String,
}

impl StructuredLogger {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
        }
    }

    pub fn log_decision(
        &self,
        instance_id: &str,
        current_size_class: &str,
        cpu_pct: Option<f64>,
        mem_pct: Option<f64>,
        decision: &SizingDecision,
    ) {
        info!(
            event = "decision_made",
            agent = %self.agent_name,
            instance_id = %instance_id,
            current_size_class = %current_size_class,
            cpu_pct = ?cpu_pct,
            mem_pct = ?mem_pct,
            decision = decision.label(),
            target = ?decision.target(),
            "Sizing decision made"
        );
    }

    pub fn log_schedule_created(
        &self,
        instance_id: &str,
        schedule_id: Uuid,
        target: &str,
        execution_time: &str,
        replaced: Option<Uuid>,
    ) {
        info!(
            event = "schedule_created",
            agent = %self.agent_name,
            instance_id = %instance_id,
            schedule_id = %schedule_id,
            target = %target,
            execution_time = %execution_time,
            replaced = ?replaced,
            "Resize scheduled"
        );
    }

    pub fn log_schedule_cancelled(&self, instance_id: &str, schedule_id: Uuid, advisory: bool) {
        info!(
            event = "schedule_cancelled",
            agent = %self.agent_name,
            instance_id = %instance_id,
            schedule_id = %schedule_id,
            advisory = advisory,
            "Resize schedule cancelled"
        );
    }

    pub fn log_phase(&self, instance_id: &str, schedule_id: Uuid, phase: ResizePhase) {
        info!(
            event = "resize_phase",
            agent = %self.agent_name,
            instance_id = %instance_id,
            schedule_id = %schedule_id,
            phase = %phase,
            "Resize phase entered"
        );
    }

    pub fn log_resize_finished(&self, outcome: &ResizeOutcome) {
        match &outcome.status {
            OutcomeStatus::Succeeded => {
                info!(
                    event = "resize_finished",
                    agent = %self.agent_name,
                    instance_id = %outcome.instance_id,
                    schedule_id = %outcome.schedule_id,
                    from = ?outcome.previous_size_class,
                    target = %outcome.target_size_class,
                    status = "succeeded",
                    duration_ms = outcome.duration_ms,
                    "Resize succeeded"
                );
            }
            OutcomeStatus::Failed { reason } => {
                warn!(
                    event = "resize_finished",
                    agent = %self.agent_name,
                    instance_id = %outcome.instance_id,
                    schedule_id = %outcome.schedule_id,
                    from = ?outcome.previous_size_class,
                    target = %outcome.target_size_class,
                    status = "failed",
                    phase = ?outcome.failed_phase,
                    reason = %reason,
                    duration_ms = outcome.duration_ms,
                    "Resize failed"
                );
            }
        }
    }

    pub fn log_startup(&self, version: &str, managed_instances: usize) {
        info!(
            event = "agent_started",
            agent = %self.agent_name,
            agent_version = %version,
            managed_instances = managed_instances,
            "Scaling agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            agent = %self.agent_name,
            reason = %reason,
            "Scaling agent shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaler_metrics_creation() {
        // Shares the global registry with other tests; only checks that
        // recording through any number of handles does not panic.
        let metrics = ScalerMetrics::new();
        let again = ScalerMetrics::new();

        metrics.inc_evaluation(&SizingDecision::NoAction);
        metrics.inc_metric_unavailable();
        metrics.inc_schedule("created");
        again.inc_execution_skipped();
        again.inc_notification_failures();
        again.set_pending_schedules(3);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("scaler-1");
        assert_eq!(logger.agent_name, "scaler-1");
    }
}
