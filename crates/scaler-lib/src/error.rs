//! Error taxonomy for the scaling control loop
//!
//! Validation errors are returned to the immediate caller and never create
//! a schedule. Transient platform errors are retried within one invocation's
//! backoff budget; terminal ones surface as a failed resize outcome.

use thiserror::Error;

/// Errors raised while turning a metric sample into a sizing decision
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    /// Neither CPU nor memory could be read. Distinct from a healthy instance.
    #[error("no utilization metrics available for {instance_id}: {reason}")]
    MetricUnavailable { instance_id: String, reason: String },

    #[error("invalid metric sample: {0}")]
    InvalidSample(String),

    #[error("size class {size_class} of {instance_id} is not on the configured ladder")]
    UnknownSizeClass {
        instance_id: String,
        size_class: String,
    },
}

/// Bad input to the scheduler, rejected synchronously and never retried
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid execution time: {0}")]
    InvalidExecutionTime(String),

    #[error("instance {instance_id} already runs {size_class}")]
    NoopTarget {
        instance_id: String,
        size_class: String,
    },

    #[error("unknown instance {0}")]
    UnknownInstance(String),

    #[error("target size class must not be empty")]
    EmptyTarget,

    #[error("a resize of {0} is already in flight")]
    ResizeInProgress(String),
}

impl ValidationError {
    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidExecutionTime(_) => "invalid_execution_time",
            ValidationError::NoopTarget { .. } => "noop_target",
            ValidationError::UnknownInstance(_) => "unknown_instance",
            ValidationError::EmptyTarget => "empty_target",
            ValidationError::ResizeInProgress(_) => "resize_in_progress",
        }
    }
}

/// Failures reported by the compute platform
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// Timeouts, throttling and similar; safe to retry
    #[error("transient platform error: {0}")]
    Transient(String),

    /// Unexpected state or rejected operation; never retried
    #[error("platform rejected the operation: {0}")]
    Terminal(String),

    #[error("instance {0} not found")]
    NotFound(String),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Transient(_))
    }
}

/// Failures from a notification transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error("permanent transport failure: {0}")]
    Permanent(String),
}

/// Failures from the durable schedule store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open schedule store: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the scheduler entry points
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Platform lookup needed for validation failed
    #[error("could not validate against the platform: {0}")]
    Platform(PlatformError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from a timer-driven scale check
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error("could not describe instance: {0}")]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_codes_are_stable() {
        assert_eq!(
            ValidationError::InvalidExecutionTime("x".into()).code(),
            "invalid_execution_time"
        );
        assert_eq!(
            ValidationError::NoopTarget {
                instance_id: "i-1".into(),
                size_class: "m5.large".into()
            }
            .code(),
            "noop_target"
        );
        assert_eq!(
            ValidationError::UnknownInstance("i-1".into()).code(),
            "unknown_instance"
        );
    }

    #[test]
    fn test_only_transient_platform_errors_retry() {
        assert!(PlatformError::Transient("throttled".into()).is_transient());
        assert!(!PlatformError::Terminal("bad state".into()).is_transient());
        assert!(!PlatformError::NotFound("i-1".into()).is_transient());
    }
}
