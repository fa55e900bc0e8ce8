//! In-memory compute platform
//!
//! Stop and start requests move the instance into a transitional state that
//! settles after a configurable number of `describe_instance` polls, which
//! mimics a real platform closely enough to drive the executor end to end.

use super::ComputePlatform;
use async_trait::async_trait;
use crate::error::PlatformError;
use crate::models::{InstanceDescription, InstanceState};
use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct SimulatedInstance {
    state: InstanceState,
    size_class: String,
    /// State reached once `polls_remaining` describes have been served
    settling_to: Option<InstanceState>,
    polls_remaining: u32,
}

/// Simulated platform backed by a concurrent map
pub struct SimulatedPlatform {
    instances: DashMap<String, SimulatedInstance>,
    transition_polls: u32,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new(2)
    }
}

impl SimulatedPlatform {
    /// Create a platform whose transitions settle after `transition_polls` describes
    pub fn new(transition_polls: u32) -> Self {
        Self {
            instances: DashMap::new(),
            transition_polls,
        }
    }

    /// Register a running instance
    pub fn add_instance(&self, instance_id: impl Into<String>, size_class: impl Into<String>) {
        self.instances.insert(
            instance_id.into(),
            SimulatedInstance {
                state: InstanceState::Running,
                size_class: size_class.into(),
                settling_to: None,
                polls_remaining: 0,
            },
        );
    }

    fn begin_transition(
        &self,
        instance_id: &str,
        allowed_from: &[InstanceState],
        intermediate: InstanceState,
        settled: InstanceState,
    ) -> Result<(), PlatformError> {
        let mut instance = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| PlatformError::NotFound(instance_id.to_string()))?;

        if instance.state == settled || instance.state == intermediate {
            return Ok(());
        }
        if !allowed_from.contains(&instance.state) {
            return Err(PlatformError::Terminal(format!(
                "IncorrectInstanceState: {} is {}",
                instance_id, instance.state
            )));
        }

        if self.transition_polls == 0 {
            instance.state = settled;
        } else {
            instance.state = intermediate;
            instance.settling_to = Some(settled);
            instance.polls_remaining = self.transition_polls;
        }
        debug!(instance_id = %instance_id, state = %instance.state, "Simulated transition started");
        Ok(())
    }
}

#[async_trait]
impl ComputePlatform for SimulatedPlatform {
    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<InstanceDescription, PlatformError> {
        let mut instance = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| PlatformError::NotFound(instance_id.to_string()))?;

        if let Some(target) = instance.settling_to {
            instance.polls_remaining = instance.polls_remaining.saturating_sub(1);
            if instance.polls_remaining == 0 {
                instance.state = target;
                instance.settling_to = None;
            }
        }

        Ok(InstanceDescription {
            instance_id: instance_id.to_string(),
            state: instance.state,
            size_class: instance.size_class.clone(),
        })
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), PlatformError> {
        self.begin_transition(
            instance_id,
            &[InstanceState::Running, InstanceState::Pending],
            InstanceState::Stopping,
            InstanceState::Stopped,
        )
    }

    async fn start_instance(&self, instance_id: &str) -> Result<(), PlatformError> {
        self.begin_transition(
            instance_id,
            &[InstanceState::Stopped],
            InstanceState::Pending,
            InstanceState::Running,
        )
    }

    async fn modify_size_class(&self, instance_id: &str, target: &str) -> Result<(), PlatformError> {
        let mut instance = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| PlatformError::NotFound(instance_id.to_string()))?;

        if instance.state != InstanceState::Stopped {
            return Err(PlatformError::Terminal(format!(
                "IncorrectInstanceState: cannot modify {} while {}",
                instance_id, instance.state
            )));
        }
        instance.size_class = target.to_string();
        Ok(())
    }
}
