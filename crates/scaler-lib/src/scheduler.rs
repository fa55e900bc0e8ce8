//! Resize scheduler
//!
//! Turns a sizing decision or a manual request into the single durable
//! pending schedule for an instance. Both entry points share the same
//! validation and the store's replace-if-pending upsert.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PlatformError, ScheduleError, ValidationError};
use crate::health::{components, HealthRegistry};
use crate::models::{ResizeSchedule, ScheduleRequest, ScheduleSource};
use crate::observability::{ScalerMetrics, StructuredLogger};
use crate::platform::ComputePlatform;
use crate::store::{CancelOutcome, ScheduleStore, UpsertOutcome};
use crate::window::{parse_execution_time, parse_utc_offset};

/// Reason recorded when an operator cancels a schedule
pub const OPERATOR_CANCEL_REASON: &str = "cancelled by operator";

#[derive(Clone)]
pub struct ResizeScheduler {
    store: ScheduleStore,
    platform: Arc<dyn ComputePlatform>,
    managed: Arc<HashSet<String>>,
    default_offset: FixedOffset,
    logger: StructuredLogger,
    metrics: Option<ScalerMetrics>,
    health: Option<HealthRegistry>,
}

impl ResizeScheduler {
    /// `managed` lists the instance ids this scheduler accepts requests for
    pub fn new<I, S>(
        store: ScheduleStore,
        platform: Arc<dyn ComputePlatform>,
        managed: I,
        default_offset: FixedOffset,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store,
            platform,
            managed: Arc::new(managed.into_iter().map(Into::into).collect()),
            default_offset,
            logger: StructuredLogger::new("scheduler"),
            metrics: None,
            health: None,
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics(mut self, metrics: ScalerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Report platform and store failures as a degraded scheduler
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    pub fn is_managed(&self, instance_id: &str) -> bool {
        self.managed.contains(instance_id)
    }

    /// Schedule from an inbound request
    pub async fn schedule(
        &self,
        request: &ScheduleRequest,
        source: ScheduleSource,
    ) -> Result<Uuid, ScheduleError> {
        self.schedule_at(request, source, Utc::now()).await
    }

    /// Schedule from an inbound request, validating against `now`
    pub async fn schedule_at(
        &self,
        request: &ScheduleRequest,
        source: ScheduleSource,
        now: DateTime<Utc>,
    ) -> Result<Uuid, ScheduleError> {
        let offset = match request.time_zone.as_deref() {
            Some(zone) if !zone.trim().is_empty() => parse_utc_offset(zone)
                .map_err(|e| ValidationError::InvalidExecutionTime(format!("time zone: {}", e)))?,
            _ => self.default_offset,
        };
        let execution_time = parse_execution_time(&request.execution_time, offset)
            .map_err(ValidationError::InvalidExecutionTime)?;

        self.submit(
            &request.instance_id,
            &request.target_size_class,
            execution_time,
            source,
            now,
        )
        .await
    }

    /// Schedule an already-resolved execution time
    pub async fn submit(
        &self,
        instance_id: &str,
        target_size_class: &str,
        execution_time: DateTime<FixedOffset>,
        source: ScheduleSource,
        now: DateTime<Utc>,
    ) -> Result<Uuid, ScheduleError> {
        let target = target_size_class.trim();
        if target.is_empty() {
            return Err(ValidationError::EmptyTarget.into());
        }
        if !self.is_managed(instance_id) {
            return Err(ValidationError::UnknownInstance(instance_id.to_string()).into());
        }
        if execution_time.with_timezone(&Utc) <= now {
            return Err(ValidationError::InvalidExecutionTime(format!(
                "{} is not in the future",
                execution_time.to_rfc3339()
            ))
            .into());
        }

        let current = match self.platform.describe_instance(instance_id).await {
            Ok(description) => description,
            Err(PlatformError::NotFound(_)) => {
                return Err(ValidationError::UnknownInstance(instance_id.to_string()).into())
            }
            Err(e) => {
                self.degrade(format!("describe_instance {}: {}", instance_id, e))
                    .await;
                return Err(ScheduleError::Platform(e));
            }
        };
        if current.size_class == target {
            return Err(ValidationError::NoopTarget {
                instance_id: instance_id.to_string(),
                size_class: current.size_class,
            }
            .into());
        }

        let record = ResizeSchedule::pending(instance_id, target, execution_time, source, now);
        let outcome = match self.store.upsert_pending(&record) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.degrade(format!("upsert for {}: {}", instance_id, e))
                    .await;
                return Err(e.into());
            }
        };
        if let Some(ref health) = self.health {
            health.set_healthy(components::SCHEDULER).await;
        }

        let replaced = match outcome {
            UpsertOutcome::Created => None,
            UpsertOutcome::Replaced { previous } => Some(previous.schedule_id),
            UpsertOutcome::Stale { current } => {
                warn!(
                    instance_id = %instance_id,
                    schedule_id = %record.schedule_id,
                    winner = %current.schedule_id,
                    "A newer schedule already holds the pending slot, request recorded as superseded"
                );
                self.count("stale");
                return Ok(record.schedule_id);
            }
            UpsertOutcome::InFlight { current } => {
                debug!(
                    instance_id = %instance_id,
                    in_flight = %current.schedule_id,
                    "Rejecting schedule while a resize is running"
                );
                return Err(ValidationError::ResizeInProgress(instance_id.to_string()).into());
            }
        };

        self.count(if replaced.is_some() { "replaced" } else { "created" });
        self.logger.log_schedule_created(
            instance_id,
            record.schedule_id,
            target,
            &execution_time.to_rfc3339(),
            replaced,
        );
        Ok(record.schedule_id)
    }

    /// Cancel the pending schedule of a managed instance
    pub fn cancel(&self, instance_id: &str) -> Result<CancelOutcome, ScheduleError> {
        self.cancel_with_reason(instance_id, OPERATOR_CANCEL_REASON)
    }

    pub fn cancel_with_reason(
        &self,
        instance_id: &str,
        reason: &str,
    ) -> Result<CancelOutcome, ScheduleError> {
        if !self.is_managed(instance_id) {
            return Err(ValidationError::UnknownInstance(instance_id.to_string()).into());
        }

        let outcome = self.store.cancel(instance_id, reason, Utc::now())?;
        match &outcome {
            CancelOutcome::Cancelled(record) => {
                self.count("cancelled");
                self.logger
                    .log_schedule_cancelled(instance_id, record.schedule_id, false);
            }
            CancelOutcome::Requested(record) => {
                self.logger
                    .log_schedule_cancelled(instance_id, record.schedule_id, true);
            }
            CancelOutcome::NoPending => {
                debug!(instance_id = %instance_id, "No pending schedule to cancel");
            }
        }
        Ok(outcome)
    }

    async fn degrade(&self, message: String) {
        warn!(error = %message, "Schedule submission failed");
        if let Some(ref health) = self.health {
            health.set_degraded(components::SCHEDULER, message).await;
        }
    }

    fn count(&self, kind: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics.inc_schedule(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::health::ComponentStatus;
    use crate::models::{InstanceDescription, ScheduleState};
    use crate::platform::SimulatedPlatform;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Simulated platform whose describe can be switched to throttling
    struct ThrottledPlatform {
        inner: SimulatedPlatform,
        throttled: AtomicBool,
    }

    #[async_trait]
    impl ComputePlatform for ThrottledPlatform {
        async fn describe_instance(
            &self,
            instance_id: &str,
        ) -> Result<InstanceDescription, PlatformError> {
            if self.throttled.load(Ordering::SeqCst) {
                return Err(PlatformError::Transient("Throttling".into()));
            }
            self.inner.describe_instance(instance_id).await
        }

        async fn stop_instance(&self, instance_id: &str) -> Result<(), PlatformError> {
            self.inner.stop_instance(instance_id).await
        }

        async fn start_instance(&self, instance_id: &str) -> Result<(), PlatformError> {
            self.inner.start_instance(instance_id).await
        }

        async fn modify_size_class(
            &self,
            instance_id: &str,
            target: &str,
        ) -> Result<(), PlatformError> {
            self.inner.modify_size_class(instance_id, target).await
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 31, 12, 0, 0).unwrap()
    }

    fn scheduler() -> ResizeScheduler {
        let platform = Arc::new(SimulatedPlatform::new(0));
        platform.add_instance("i-0abc", "m5.large");
        platform.add_instance("i-gone-from-config", "m5.large");
        ResizeScheduler::new(
            ScheduleStore::open_in_memory().unwrap(),
            platform,
            ["i-0abc", "i-missing"],
            FixedOffset::east_opt(0).unwrap(),
        )
    }

    fn request(target: &str, at: &str, tz: Option<&str>) -> ScheduleRequest {
        ScheduleRequest {
            instance_id: "i-0abc".to_string(),
            target_size_class: target.to_string(),
            execution_time: at.to_string(),
            time_zone: tz.map(str::to_string),
        }
    }

    fn validation(err: ScheduleError) -> ValidationError {
        match err {
            ScheduleError::Validation(v) => v,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_schedule_creates_pending() {
        let scheduler = scheduler();
        let id = scheduler
            .schedule_at(
                &request("m5.xlarge", "2025-01-01T02:00:00+08:00", None),
                ScheduleSource::Manual,
                now(),
            )
            .await
            .unwrap();

        let current = scheduler.store().get_current("i-0abc").unwrap().unwrap();
        assert_eq!(current.schedule_id, id);
        assert_eq!(current.state, ScheduleState::Pending);
        assert_eq!(current.target_size_class, "m5.xlarge");
        assert_eq!(current.execution_time.offset().local_minus_utc(), 8 * 3600);
    }

    #[tokio::test]
    async fn test_naive_time_read_in_supplied_zone() {
        let scheduler = scheduler();
        scheduler
            .schedule_at(
                &request("m5.xlarge", "2025-01-01 02:00", Some("+08:00")),
                ScheduleSource::Manual,
                now(),
            )
            .await
            .unwrap();

        let current = scheduler.store().get_current("i-0abc").unwrap().unwrap();
        assert_eq!(
            current.execution_time.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 12, 31, 18, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_second_schedule_replaces_first() {
        let scheduler = scheduler();
        let first = scheduler
            .schedule_at(
                &request("m5.xlarge", "2025-01-01T02:00:00Z", None),
                ScheduleSource::Manual,
                now(),
            )
            .await
            .unwrap();
        let second = scheduler
            .schedule_at(
                &request("m5.2xlarge", "2025-01-02T02:00:00Z", None),
                ScheduleSource::Manual,
                now() + chrono::Duration::seconds(1),
            )
            .await
            .unwrap();

        let pending = scheduler.store().list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].schedule_id, second);
        assert_eq!(pending[0].target_size_class, "m5.2xlarge");

        let replaced = scheduler.store().get(first).unwrap().unwrap();
        assert_eq!(replaced.state, ScheduleState::Cancelled);
    }

    #[tokio::test]
    async fn test_past_time_rejected() {
        let err = scheduler()
            .schedule_at(
                &request("m5.xlarge", "2024-12-31T11:59:59Z", None),
                ScheduleSource::Manual,
                now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            validation(err),
            ValidationError::InvalidExecutionTime(_)
        ));
    }

    #[tokio::test]
    async fn test_unparsable_time_rejected() {
        let err = scheduler()
            .schedule_at(
                &request("m5.xlarge", "next tuesday", None),
                ScheduleSource::Manual,
                now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            validation(err),
            ValidationError::InvalidExecutionTime(_)
        ));
    }

    #[tokio::test]
    async fn test_named_zone_rejected() {
        let err = scheduler()
            .schedule_at(
                &request("m5.xlarge", "2025-01-01 02:00", Some("Asia/Singapore")),
                ScheduleSource::Manual,
                now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            validation(err),
            ValidationError::InvalidExecutionTime(_)
        ));
    }

    #[tokio::test]
    async fn test_noop_target_rejected() {
        let scheduler = scheduler();
        let err = scheduler
            .schedule_at(
                &request("m5.large", "2025-01-01T02:00:00Z", None),
                ScheduleSource::Manual,
                now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(validation(err), ValidationError::NoopTarget { .. }));
        assert!(scheduler.store().get_current("i-0abc").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_target_rejected() {
        let err = scheduler()
            .schedule_at(
                &request("  ", "2025-01-01T02:00:00Z", None),
                ScheduleSource::Manual,
                now(),
            )
            .await
            .unwrap_err();
        assert_eq!(validation(err), ValidationError::EmptyTarget);
    }

    #[tokio::test]
    async fn test_unmanaged_instance_rejected() {
        let mut req = request("m5.xlarge", "2025-01-01T02:00:00Z", None);
        req.instance_id = "i-gone-from-config".to_string();
        let err = scheduler()
            .schedule_at(&req, ScheduleSource::Manual, now())
            .await
            .unwrap_err();
        assert!(matches!(
            validation(err),
            ValidationError::UnknownInstance(_)
        ));
    }

    #[tokio::test]
    async fn test_instance_missing_on_platform_rejected() {
        let mut req = request("m5.xlarge", "2025-01-01T02:00:00Z", None);
        req.instance_id = "i-missing".to_string();
        let err = scheduler()
            .schedule_at(&req, ScheduleSource::Manual, now())
            .await
            .unwrap_err();
        assert!(matches!(
            validation(err),
            ValidationError::UnknownInstance(_)
        ));
    }

    #[tokio::test]
    async fn test_schedule_rejected_while_in_flight() {
        let scheduler = scheduler();
        let id = scheduler
            .schedule_at(
                &request("m5.xlarge", "2025-01-01T02:00:00Z", None),
                ScheduleSource::Manual,
                now(),
            )
            .await
            .unwrap();
        scheduler.store().claim("i-0abc", id, now()).unwrap();

        let err = scheduler
            .schedule_at(
                &request("m5.2xlarge", "2025-01-02T02:00:00Z", None),
                ScheduleSource::Manual,
                now() + chrono::Duration::seconds(1),
            )
            .await
            .unwrap_err();
        assert_eq!(
            validation(err),
            ValidationError::ResizeInProgress("i-0abc".to_string())
        );
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let scheduler = scheduler();
        scheduler
            .schedule_at(
                &request("m5.xlarge", "2025-01-01T02:00:00Z", None),
                ScheduleSource::Manual,
                now(),
            )
            .await
            .unwrap();

        let outcome = scheduler.cancel("i-0abc").unwrap();
        assert!(matches!(outcome, CancelOutcome::Cancelled(_)));
        assert!(scheduler.store().list_pending().unwrap().is_empty());
        assert_eq!(scheduler.cancel("i-0abc").unwrap(), CancelOutcome::NoPending);
    }

    #[test]
    fn test_cancel_unknown_instance() {
        let err = scheduler().cancel("i-nope").unwrap_err();
        assert!(matches!(
            validation(err),
            ValidationError::UnknownInstance(_)
        ));
    }

    async fn scheduler_status(health: &HealthRegistry) -> ComponentStatus {
        health.health().await.components[components::SCHEDULER].status
    }

    #[tokio::test]
    async fn test_platform_error_degrades_scheduler_until_next_success() {
        let inner = SimulatedPlatform::new(0);
        inner.add_instance("i-0abc", "m5.large");
        let platform = Arc::new(ThrottledPlatform {
            inner,
            throttled: AtomicBool::new(true),
        });
        let health = HealthRegistry::new();
        health.register(components::SCHEDULER).await;
        let scheduler = ResizeScheduler::new(
            ScheduleStore::open_in_memory().unwrap(),
            platform.clone(),
            ["i-0abc"],
            FixedOffset::east_opt(0).unwrap(),
        )
        .with_health(health.clone());
        let req = request("m5.xlarge", "2025-01-01T02:00:00Z", None);

        let err = scheduler
            .schedule_at(&req, ScheduleSource::Manual, now())
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Platform(PlatformError::Transient(_))));
        assert_eq!(scheduler_status(&health).await, ComponentStatus::Degraded);

        platform.throttled.store(false, Ordering::SeqCst);
        scheduler
            .schedule_at(&req, ScheduleSource::Manual, now())
            .await
            .unwrap();
        assert_eq!(scheduler_status(&health).await, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_store_error_degrades_scheduler() {
        let health = HealthRegistry::new();
        let scheduler = scheduler().with_health(health.clone());
        scheduler.store().put_raw("i-0abc", b"not json").unwrap();

        let err = scheduler
            .schedule_at(
                &request("m5.xlarge", "2025-01-01T02:00:00Z", None),
                ScheduleSource::Manual,
                now(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ScheduleError::Store(StoreError::Deserialize(_))));
        let health = health.health().await;
        let component = &health.components[components::SCHEDULER];
        assert_eq!(component.status, ComponentStatus::Degraded);
        assert!(component.message.as_deref().unwrap().contains("i-0abc"));
    }

    #[tokio::test]
    async fn test_validation_errors_leave_scheduler_health_alone() {
        let health = HealthRegistry::new();
        health.register(components::SCHEDULER).await;
        let scheduler = scheduler().with_health(health.clone());

        scheduler
            .schedule_at(
                &request("m5.large", "2025-01-01T02:00:00Z", None),
                ScheduleSource::Manual,
                now(),
            )
            .await
            .unwrap_err();

        assert_eq!(scheduler_status(&health).await, ComponentStatus::Healthy);
    }
}
