//! Core data models for the vertical scaler

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ladder::SizeLadder;
use crate::window::MaintenanceWindow;

/// Upsize/downsize thresholds, expressed as utilization percentages
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub cpu_upsize: f64,
    pub cpu_downsize: f64,
    pub mem_upsize: f64,
    pub mem_downsize: f64,
}

impl Thresholds {
    /// Check every threshold is a finite percentage
    pub fn validate(&self) -> Result<(), String> {
        let named = [
            ("cpu_upsize", self.cpu_upsize),
            ("cpu_downsize", self.cpu_downsize),
            ("mem_upsize", self.mem_upsize),
            ("mem_downsize", self.mem_downsize),
        ];
        for (name, value) in named {
            if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                return Err(format!("{} must be within 0..=100, got {}", name, value));
            }
        }
        Ok(())
    }
}

/// A managed instance as configured by the operator.
///
/// This is the static half of an [`InstanceProfile`]; the current size class
/// is read from the compute platform at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedInstance {
    pub instance_id: String,
    pub thresholds: Thresholds,
    pub ladder: SizeLadder,
    pub notification_channel: String,
    /// Trailing window the metric sample is aggregated over
    #[serde(default = "default_metric_window_secs")]
    pub metric_window_secs: u64,
    pub maintenance_window: MaintenanceWindow,
}

fn default_metric_window_secs() -> u64 {
    // One week, matching a weekly evaluation cadence
    7 * 24 * 60 * 60
}

impl ManagedInstance {
    /// Build the per-cycle profile once the current size class is known
    pub fn profile(&self, current_size_class: impl Into<String>) -> InstanceProfile {
        InstanceProfile {
            instance_id: self.instance_id.clone(),
            current_size_class: current_size_class.into(),
            thresholds: self.thresholds,
            ladder: self.ladder.clone(),
            notification_channel: self.notification_channel.clone(),
        }
    }
}

/// Everything the evaluator needs to know about one instance for one cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceProfile {
    pub instance_id: String,
    pub current_size_class: String,
    pub thresholds: Thresholds,
    pub ladder: SizeLadder,
    pub notification_channel: String,
}

/// Raw utilization as reported by a metrics source
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Utilization {
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
}

/// Point-in-time utilization reading for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub cpu_pct: Option<f64>,
    /// Absent when no agent on the instance reports memory
    pub mem_pct: Option<f64>,
    pub window_secs: u64,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(utilization: Utilization, window_secs: u64) -> Self {
        Self {
            cpu_pct: utilization.cpu_pct,
            mem_pct: utilization.mem_pct,
            window_secs,
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of evaluating one sample against one profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SizingDecision {
    NoAction,
    Upsize { target: String },
    Downsize { target: String },
}

impl SizingDecision {
    /// Target size class, if the decision requires a resize
    pub fn target(&self) -> Option<&str> {
        match self {
            SizingDecision::NoAction => None,
            SizingDecision::Upsize { target } | SizingDecision::Downsize { target } => {
                Some(target)
            }
        }
    }

    /// Short label used for logs and metric labels
    pub fn label(&self) -> &'static str {
        match self {
            SizingDecision::NoAction => "no_action",
            SizingDecision::Upsize { .. } => "upsize",
            SizingDecision::Downsize { .. } => "downsize",
        }
    }
}

/// Lifecycle state of a resize schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleState {
    Pending,
    Fired,
    Cancelled,
}

impl std::fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleState::Pending => write!(f, "pending"),
            ScheduleState::Fired => write!(f, "fired"),
            ScheduleState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Which entry point created a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleSource {
    /// Timer-driven scale check
    Evaluator,
    /// Direct request from an operator or external caller
    Manual,
}

/// Final status of a resize attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OutcomeStatus {
    Succeeded,
    Failed { reason: String },
}

impl OutcomeStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeStatus::Succeeded)
    }

    pub fn label(&self) -> &'static str {
        match self {
            OutcomeStatus::Succeeded => "succeeded",
            OutcomeStatus::Failed { .. } => "failed",
        }
    }
}

/// Durable deferred-resize record, at most one pending per instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeSchedule {
    pub schedule_id: Uuid,
    pub instance_id: String,
    pub target_size_class: String,
    pub execution_time: DateTime<FixedOffset>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: ScheduleState,
    pub source: ScheduleSource,
    /// Set when an executor has taken ownership of this pending record
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Cancellation arrived while an execution was already in flight
    #[serde(default)]
    pub cancel_requested: bool,
    /// Populated when the record is stamped fired
    #[serde(default)]
    pub result: Option<OutcomeStatus>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
}

impl ResizeSchedule {
    /// Create a new pending record
    pub fn pending(
        instance_id: impl Into<String>,
        target_size_class: impl Into<String>,
        execution_time: DateTime<FixedOffset>,
        source: ScheduleSource,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            schedule_id: Uuid::new_v4(),
            instance_id: instance_id.into(),
            target_size_class: target_size_class.into(),
            execution_time,
            created_at: now,
            updated_at: now,
            state: ScheduleState::Pending,
            source,
            claimed_at: None,
            cancel_requested: false,
            result: None,
            cancel_reason: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == ScheduleState::Pending
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_at.is_some()
    }

    /// Pending, unclaimed and at or past its execution time
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && !self.is_claimed() && self.execution_time.with_timezone(&Utc) <= now
    }

    /// Whether this record wins over `other` for the same pending slot
    pub fn supersedes(&self, other: &ResizeSchedule) -> bool {
        (self.created_at, self.schedule_id) > (other.created_at, other.schedule_id)
    }
}

/// Steps of the resize state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizePhase {
    Fetching,
    Stopping,
    ModifyingType,
    Starting,
    Verifying,
    Done,
    Failed,
}

impl ResizePhase {
    /// Phases at or after which a failure leaves the instance modified or stopped
    pub fn is_past_modify(&self) -> bool {
        matches!(
            self,
            ResizePhase::ModifyingType | ResizePhase::Starting | ResizePhase::Verifying
        )
    }
}

impl std::fmt::Display for ResizePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResizePhase::Fetching => "fetching",
            ResizePhase::Stopping => "stopping",
            ResizePhase::ModifyingType => "modifying_type",
            ResizePhase::Starting => "starting",
            ResizePhase::Verifying => "verifying",
            ResizePhase::Done => "done",
            ResizePhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Result of one executor run, handed to the notifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeOutcome {
    pub schedule_id: Uuid,
    pub instance_id: String,
    /// Unknown when the instance could not be described at all
    pub previous_size_class: Option<String>,
    pub target_size_class: String,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<ResizePhase>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Power state reported by the compute platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::ShuttingDown => "shutting_down",
            InstanceState::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

/// Snapshot of an instance as described by the compute platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub state: InstanceState,
    pub size_class: String,
}

/// Inbound request to schedule a resize, from either entry point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub instance_id: String,
    pub target_size_class: String,
    /// RFC 3339 timestamp, or a naive local timestamp read in `time_zone`
    pub execution_time: String,
    #[serde(default)]
    pub time_zone: Option<String>,
}
