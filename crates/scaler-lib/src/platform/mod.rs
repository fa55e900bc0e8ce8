//! Compute platform abstraction
//!
//! All calls are treated as slow, fallible remote operations. State
//! transitions (stop, start) are asynchronous on the platform side and must
//! be observed by polling `describe_instance`.

mod simulated;

pub use simulated::SimulatedPlatform;

use crate::error::PlatformError;
use crate::models::InstanceDescription;

use async_trait::async_trait;

/// Instance lifecycle primitives of the underlying compute platform
#[async_trait]
pub trait ComputePlatform: Send + Sync {
    /// Current power state and size class
    async fn describe_instance(&self, instance_id: &str)
        -> Result<InstanceDescription, PlatformError>;

    /// Request a stop; returns before the instance is stopped
    async fn stop_instance(&self, instance_id: &str) -> Result<(), PlatformError>;

    /// Request a start; returns before the instance is running
    async fn start_instance(&self, instance_id: &str) -> Result<(), PlatformError>;

    /// Change the size class. Rejected unless the instance is stopped.
    async fn modify_size_class(&self, instance_id: &str, target: &str)
        -> Result<(), PlatformError>;
}
