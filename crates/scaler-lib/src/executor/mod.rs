//! Resize executor
//!
//! Drives one due schedule through
//! `Fetching -> Stopping -> ModifyingType -> Starting -> Verifying -> Done | Failed`.
//!
//! Ownership of a schedule is taken with an atomic claim in the store, so a
//! duplicate trigger for the same schedule finds it claimed or terminal and
//! returns without touching the instance. Every finished run stamps the
//! schedule `Fired` and hands exactly one outcome to the notifier.


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::{poll_until, PollOutcome, RetryPolicy};
use crate::error::{PlatformError, StoreError};
use crate::models::{
    InstanceDescription, InstanceState, OutcomeStatus, ResizeOutcome, ResizePhase,
    ResizeSchedule, ScheduleState,
};
use crate::notifier::Notifier;
use crate::observability::{ScalerMetrics, StructuredLogger};
use crate::platform::ComputePlatform;
use crate::store::{ClaimOutcome, ScheduleStore};

/// Channel used when an instance has no configured notification channel
pub const DEFAULT_CHANNEL: &str = "default";

/// Reason recorded on claims that outlived the executor's time budget
pub const ABANDONED_REASON: &str = "abandoned: execution did not finish within its time budget";

/// Timing configuration for the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// First wait between state polls
    pub poll_interval: Duration,
    /// Upper bound for the growing wait between state polls
    pub max_poll_interval: Duration,
    /// Bound on waiting for the instance to report stopped
    pub stop_timeout: Duration,
    /// Bound on waiting for the instance to report running
    pub start_timeout: Duration,
    /// Retry policy for transient platform errors
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_poll_interval: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(600),
            start_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

impl ExecutorConfig {
    /// Upper bound on the wall-clock time one execution can take.
    ///
    /// Claims older than this are treated as abandoned.
    pub fn time_budget(&self) -> Duration {
        let retry_worst: Duration = (1..self.retry.max_attempts.max(1))
            .map(|attempt| self.retry.delay_for(attempt))
            .sum();
        // describe, boot wait, stop, modify, start, verify plus poll slack
        self.stop_timeout + self.start_timeout * 2 + retry_worst * 8 + self.max_poll_interval * 2
    }
}

/// Why an invocation did nothing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// No such schedule in the store
    Unknown,
    /// Already fired or cancelled, including superseded records
    NotPending { state: ScheduleState },
    /// Another invocation owns the schedule
    ClaimedElsewhere,
    /// Execution time has not elapsed yet
    NotDue,
    /// Cancellation arrived before the instance was touched
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Unknown => write!(f, "unknown schedule"),
            SkipReason::NotPending { state } => write!(f, "schedule already {}", state),
            SkipReason::ClaimedElsewhere => write!(f, "schedule claimed by another execution"),
            SkipReason::NotDue => write!(f, "schedule not due yet"),
            SkipReason::Cancelled => write!(f, "schedule cancelled before execution"),
        }
    }
}

/// Result of one executor invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Skipped(SkipReason),
    Finished(ResizeOutcome),
}

/// A failed run: where it stopped and why
#[derive(Debug)]
struct PhaseFailure {
    phase: ResizePhase,
    reason: String,
}

impl PhaseFailure {
    fn new(phase: ResizePhase, reason: impl Into<String>) -> Self {
        Self {
            phase,
            reason: reason.into(),
        }
    }

    fn platform(phase: ResizePhase, operation: &str, err: PlatformError) -> Self {
        Self::new(phase, format!("{} failed: {}", operation, err))
    }
}

/// How the state machine ended when it did not fail
enum RunEnd {
    Completed,
    Cancelled,
}

/// Executes due resize schedules against a compute platform
#[derive(Clone)]
pub struct ResizeExecutor {
    platform: Arc<dyn ComputePlatform>,
    store: ScheduleStore,
    notifier: Notifier,
    config: ExecutorConfig,
    channels: Arc<HashMap<String, String>>,
    logger: StructuredLogger,
    metrics: Option<ScalerMetrics>,
}

impl ResizeExecutor {
    pub fn new(
        platform: Arc<dyn ComputePlatform>,
        store: ScheduleStore,
        notifier: Notifier,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            platform,
            store,
            notifier,
            config,
            channels: Arc::new(HashMap::new()),
            logger: StructuredLogger::new("executor"),
            metrics: None,
        }
    }

    /// Notification channel per instance id
    pub fn with_channels(mut self, channels: HashMap<String, String>) -> Self {
        self.channels = Arc::new(channels);
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

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn channel_for(&self, instance_id: &str) -> &str {
        self.channels
            .get(instance_id)
            .map(String::as_str)
            .unwrap_or(DEFAULT_CHANNEL)
    }

    /// Execute a schedule that is due.
    ///
    /// Store errors while claiming are returned; every failure after the
    /// claim becomes a `Failed` outcome.
    pub async fn execute(&self, schedule: &ResizeSchedule) -> Result<Execution, StoreError> {
        let now = Utc::now();
        if schedule.execution_time.with_timezone(&Utc) > now {
            return Ok(self.skipped(schedule, SkipReason::NotDue));
        }

        let record = match self
            .store
            .claim(&schedule.instance_id, schedule.schedule_id, now)?
        {
            ClaimOutcome::Claimed(record) => record,
            ClaimOutcome::NotPending(Some(record)) => {
                return Ok(self.skipped(
                    schedule,
                    SkipReason::NotPending {
                        state: record.state,
                    },
                ))
            }
            ClaimOutcome::NotPending(None) => return Ok(self.skipped(schedule, SkipReason::Unknown)),
            ClaimOutcome::AlreadyClaimed(_) => {
                return Ok(self.skipped(schedule, SkipReason::ClaimedElsewhere))
            }
        };

        info!(
            instance_id = %record.instance_id,
            schedule_id = %record.schedule_id,
            target = %record.target_size_class,
            "Resize execution claimed"
        );

        let started = Instant::now();
        let mut previous_size_class = None;
        let (status, failed_phase) = match self.run(&record, &mut previous_size_class).await {
            Ok(RunEnd::Completed) => (OutcomeStatus::Succeeded, None),
            Ok(RunEnd::Cancelled) => return Ok(self.skipped(&record, SkipReason::Cancelled)),
            Err(failure) => (
                OutcomeStatus::Failed {
                    reason: failure.reason,
                },
                Some(failure.phase),
            ),
        };

        let outcome = ResizeOutcome {
            schedule_id: record.schedule_id,
            instance_id: record.instance_id.clone(),
            previous_size_class,
            target_size_class: record.target_size_class.clone(),
            status,
            failed_phase,
            duration_ms: started.elapsed().as_millis() as u64,
            finished_at: Utc::now(),
        };

        self.finish(&outcome).await;
        Ok(Execution::Finished(outcome))
    }

    /// Stamp an abandoned claim `Fired(Failed)` and notify once
    pub async fn fail_abandoned(
        &self,
        record: &ResizeSchedule,
    ) -> Result<Option<ResizeOutcome>, StoreError> {
        let now = Utc::now();
        let status = OutcomeStatus::Failed {
            reason: ABANDONED_REASON.to_string(),
        };
        let Some(stamped) =
            self.store
                .complete(&record.instance_id, record.schedule_id, status.clone(), now)?
        else {
            return Ok(None);
        };

        let duration_ms = stamped
            .claimed_at
            .map(|claimed| (now - claimed).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let outcome = ResizeOutcome {
            schedule_id: stamped.schedule_id,
            instance_id: stamped.instance_id.clone(),
            previous_size_class: None,
            target_size_class: stamped.target_size_class.clone(),
            status,
            failed_phase: None,
            duration_ms,
            finished_at: now,
        };

        self.report(&outcome).await;
        Ok(Some(outcome))
    }

    fn skipped(&self, schedule: &ResizeSchedule, reason: SkipReason) -> Execution {
        info!(
            instance_id = %schedule.instance_id,
            schedule_id = %schedule.schedule_id,
            reason = %reason,
            "Resize execution skipped"
        );
        if let Some(ref metrics) = self.metrics {
            metrics.inc_execution_skipped();
        }
        Execution::Skipped(reason)
    }

    /// Persist the outcome, then report it
    async fn finish(&self, outcome: &ResizeOutcome) {
        match self.store.complete(
            &outcome.instance_id,
            outcome.schedule_id,
            outcome.status.clone(),
            outcome.finished_at,
        ) {
            Ok(Some(_)) => {}
            Ok(None) => warn!(
                instance_id = %outcome.instance_id,
                schedule_id = %outcome.schedule_id,
                "Claimed schedule vanished before it could be stamped fired"
            ),
            Err(e) => error!(
                instance_id = %outcome.instance_id,
                schedule_id = %outcome.schedule_id,
                error = %e,
                "Failed to stamp schedule fired"
            ),
        }
        self.report(outcome).await;
    }

    async fn report(&self, outcome: &ResizeOutcome) {
        self.logger.log_resize_finished(outcome);
        if let Some(ref metrics) = self.metrics {
            metrics.record_execution(outcome);
        }
        self.notifier
            .notify(self.channel_for(&outcome.instance_id), outcome)
            .await;
    }

    fn enter(&self, record: &ResizeSchedule, phase: ResizePhase) {
        self.logger
            .log_phase(&record.instance_id, record.schedule_id, phase);
    }

    async fn run(
        &self,
        record: &ResizeSchedule,
        previous_size_class: &mut Option<String>,
    ) -> Result<RunEnd, PhaseFailure> {
        let instance_id = record.instance_id.as_str();
        let target = record.target_size_class.as_str();

        self.enter(record, ResizePhase::Fetching);
        let current = self
            .describe(instance_id)
            .await
            .map_err(|e| PhaseFailure::platform(ResizePhase::Fetching, "describe_instance", e))?;
        *previous_size_class = Some(current.size_class.clone());

        // Last point at which a cancellation is honoured
        match self.store.cancel_if_requested(instance_id, record.schedule_id, Utc::now()) {
            Ok(Some(_)) => return Ok(RunEnd::Cancelled),
            Ok(None) => {}
            Err(e) => warn!(
                instance_id = %instance_id,
                error = %e,
                "Could not check for a pending cancellation, continuing"
            ),
        }

        if matches!(
            current.state,
            InstanceState::ShuttingDown | InstanceState::Terminated
        ) {
            return Err(PhaseFailure::new(
                ResizePhase::Fetching,
                format!("instance is {}", current.state),
            ));
        }

        if current.size_class == target && current.state == InstanceState::Running {
            debug!(instance_id = %instance_id, target = %target, "Instance already at target class");
            return Ok(RunEnd::Completed);
        }

        if current.size_class != target {
            if current.state != InstanceState::Stopped {
                self.enter(record, ResizePhase::Stopping);
                self.stop(instance_id, current.state).await?;
            }

            self.enter(record, ResizePhase::ModifyingType);
            let platform = self.platform.as_ref();
            self.config
                .retry
                .retry("modify_size_class", move || {
                    platform.modify_size_class(instance_id, target)
                })
                .await
                .map_err(|e| {
                    PhaseFailure::platform(ResizePhase::ModifyingType, "modify_size_class", e)
                })?;
        }

        self.enter(record, ResizePhase::Starting);
        self.start(instance_id).await?;

        self.enter(record, ResizePhase::Verifying);
        let verified = self
            .describe(instance_id)
            .await
            .map_err(|e| PhaseFailure::platform(ResizePhase::Verifying, "describe_instance", e))?;
        if verified.size_class != target {
            return Err(PhaseFailure::new(
                ResizePhase::Verifying,
                format!(
                    "instance reports size class {} after resize, expected {}",
                    verified.size_class, target
                ),
            ));
        }

        self.enter(record, ResizePhase::Done);
        Ok(RunEnd::Completed)
    }

    async fn describe(&self, instance_id: &str) -> Result<InstanceDescription, PlatformError> {
        let platform = self.platform.as_ref();
        self.config
            .retry
            .retry("describe_instance", move || {
                platform.describe_instance(instance_id)
            })
            .await
    }

    async fn stop(&self, instance_id: &str, state: InstanceState) -> Result<(), PhaseFailure> {
        let state = if state == InstanceState::Pending {
            // A booting instance has to settle before it can take a stop
            debug!(instance_id = %instance_id, "Instance is booting, waiting before stop");
            self.wait_for_any(
                instance_id,
                &[InstanceState::Running, InstanceState::Stopped],
                self.config.start_timeout,
            )
            .await
            .map_err(|reason| PhaseFailure::new(ResizePhase::Stopping, reason))?
        } else {
            state
        };
        if state == InstanceState::Stopped {
            return Ok(());
        }

        if state != InstanceState::Stopping {
            let platform = self.platform.as_ref();
            self.config
                .retry
                .retry("stop_instance", move || platform.stop_instance(instance_id))
                .await
                .map_err(|e| PhaseFailure::platform(ResizePhase::Stopping, "stop_instance", e))?;
        }

        self.wait_for(instance_id, InstanceState::Stopped, self.config.stop_timeout)
            .await
            .map_err(|reason| PhaseFailure::new(ResizePhase::Stopping, reason))
    }

    async fn start(&self, instance_id: &str) -> Result<(), PhaseFailure> {
        let platform = self.platform.as_ref();
        self.config
            .retry
            .retry("start_instance", move || platform.start_instance(instance_id))
            .await
            .map_err(|e| PhaseFailure::platform(ResizePhase::Starting, "start_instance", e))?;

        self.wait_for(instance_id, InstanceState::Running, self.config.start_timeout)
            .await
            .map_err(|reason| PhaseFailure::new(ResizePhase::Starting, reason))
    }

    /// Poll until the instance reports `wanted`, failing fast on terminated
    async fn wait_for(
        &self,
        instance_id: &str,
        wanted: InstanceState,
        timeout: Duration,
    ) -> Result<(), String> {
        self.wait_for_any(instance_id, &[wanted], timeout)
            .await
            .map(|_| ())
    }

    /// Poll until the instance reports one of `wanted`, returning that state
    async fn wait_for_any(
        &self,
        instance_id: &str,
        wanted: &[InstanceState],
        timeout: Duration,
    ) -> Result<InstanceState, String> {
        let expected = wanted
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" or ");
        let what = format!("{} {}", instance_id, expected);
        let outcome = poll_until(
            &what,
            self.config.poll_interval,
            self.config.max_poll_interval,
            timeout,
            || async move {
                let description = self.describe(instance_id).await?;
                match description.state {
                    state if wanted.contains(&state) => Ok(Some(state)),
                    InstanceState::Terminated | InstanceState::ShuttingDown => {
                        Err(PlatformError::Terminal(format!(
                            "instance {} is {}",
                            instance_id, description.state
                        )))
                    }
                    _ => Ok(None),
                }
            },
        )
        .await
        .map_err(|e| format!("waiting for {} failed: {}", expected, e))?;

        match outcome {
            PollOutcome::Reached(state) => Ok(state),
            PollOutcome::TimedOut => Err(format!(
                "timed out after {}s waiting for instance to report {}",
                timeout.as_secs(),
                expected
            )),
        }
    }
}
