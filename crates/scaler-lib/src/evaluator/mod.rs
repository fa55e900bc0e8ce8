//! Metric evaluation
//!
//! Reads current utilization for an instance and applies the threshold
//! policy to produce a sizing decision. Scheduling is delegated to the
//! caller.

mod policy;
mod source;

pub use policy::evaluate;
pub use source::{read_sample, HttpMetricsSource, StaticMetricsSource};

use crate::models::Utilization;
use std::time::Duration;

use async_trait::async_trait;

/// Failure to read utilization from a metrics source
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("metrics source error: {0}")]
pub struct MetricsSourceError(pub String);

/// Trait for utilization sources
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Aggregate CPU and memory utilization over the trailing `window`
    async fn utilization(
        &self,
        instance_id: &str,
        window: Duration,
    ) -> Result<Utilization, MetricsSourceError>;
}
