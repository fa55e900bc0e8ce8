//! Vertical scaling control loop
//!
//! This crate provides the core functionality for:
//! - Evaluating utilization against threshold policy
//! - Durable deferred resize schedules
//! - The resize execution state machine
//! - Outcome notifications
//! - Health checks and observability

pub mod backoff;
pub mod check;
pub mod dispatch;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod health;
pub mod ladder;
pub mod models;
pub mod notifier;
pub mod observability;
pub mod platform;
pub mod scheduler;
pub mod store;
pub mod window;

pub use check::{CheckReport, ScaleCheck};
pub use dispatch::{DispatchConfig, DispatchLoop};
pub use error::{
    CheckError, EvaluationError, PlatformError, ScheduleError, StoreError, TransportError,
    ValidationError,
};
pub use executor::{Execution, ExecutorConfig, ResizeExecutor, SkipReason};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use ladder::SizeLadder;
pub use models::*;
pub use notifier::{Notifier, NotificationTransport};
pub use observability::{ScalerMetrics, StructuredLogger};
pub use scheduler::ResizeScheduler;
pub use store::ScheduleStore;
pub use window::MaintenanceWindow;
