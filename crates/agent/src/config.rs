//! Agent configuration
//!
//! Loaded from an optional TOML file (`SCALER_CONFIG`, default
//! `scaler.toml`) overlaid with `SCALER__*` environment variables.

use anyhow::{bail, Context, Result};
use scaler_lib::backoff::RetryPolicy;
use scaler_lib::evaluator::{HttpMetricsSource, MetricsSource, StaticMetricsSource};
use scaler_lib::executor::ExecutorConfig;
use scaler_lib::notifier::{LogTransport, NotificationTransport, WebhookTransport};
use scaler_lib::platform::{ComputePlatform, SimulatedPlatform};
use scaler_lib::window::parse_utc_offset;
use scaler_lib::{ManagedInstance, Utilization};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name attached to structured log events
    #[serde(default = "default_agent_name")]
    pub agent_name: String,

    /// Port for the scheduling API, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Bearer token required on mutating endpoints; open when unset
    #[serde(default)]
    pub api_token: Option<String>,

    /// Path of the redb schedule database
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Interval between timer-driven scale checks
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Interval between scans for due schedules
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_secs: u64,

    /// Minimum lead time between a check and the window it schedules into
    #[serde(default = "default_min_lead")]
    pub min_lead_secs: u64,

    /// Offset applied to naive execution times without a time zone
    #[serde(default = "default_utc_offset")]
    pub default_utc_offset: String,

    #[serde(default)]
    pub executor: ExecutorSettings,

    #[serde(default)]
    pub notifier: NotifierSettings,

    #[serde(default)]
    pub metrics_source: MetricsSourceSettings,

    #[serde(default)]
    pub platform: PlatformSettings,

    /// Managed instance profiles
    #[serde(default)]
    pub instances: Vec<ManagedInstance>,
}

fn default_agent_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "scaling-agent".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_store_path() -> String {
    "scaler.redb".to_string()
}

fn default_check_interval() -> u64 {
    // Weekly
    7 * 24 * 60 * 60
}

fn default_dispatch_interval() -> u64 {
    30
}

fn default_min_lead() -> u64 {
    300
}

fn default_utc_offset() -> String {
    "+00:00".to_string()
}

/// Executor timings in seconds, retry policy in milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_secs: u64,
    #[serde(default = "default_transition_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_transition_timeout")]
    pub start_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_poll_interval() -> u64 {
    30
}

fn default_transition_timeout() -> u64 {
    600
}

fn default_shutdown_grace() -> u64 {
    60
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_poll_interval_secs: default_max_poll_interval(),
            stop_timeout_secs: default_transition_timeout(),
            start_timeout_secs: default_transition_timeout(),
            retry: RetryPolicy::default(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl ExecutorSettings {
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            max_poll_interval: Duration::from_secs(self.max_poll_interval_secs.max(1)),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            start_timeout: Duration::from_secs(self.start_timeout_secs),
            retry: self.retry,
        }
    }
}

/// Notification transport selection
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifierSettings {
    #[default]
    Log,
    Webhook {
        url: String,
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
    },
}

fn default_http_timeout() -> u64 {
    10
}

impl NotifierSettings {
    pub fn build(&self) -> Result<Arc<dyn NotificationTransport>> {
        Ok(match self {
            NotifierSettings::Log => Arc::new(LogTransport),
            NotifierSettings::Webhook { url, timeout_secs } => Arc::new(
                WebhookTransport::new(url, Duration::from_secs(*timeout_secs))
                    .context("Failed to configure webhook notifier")?,
            ),
        })
    }
}

/// Utilization source selection
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricsSourceSettings {
    /// Fixed readings per instance id
    Static {
        #[serde(default)]
        readings: HashMap<String, Utilization>,
    },
    Http {
        base_url: String,
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
    },
}

impl Default for MetricsSourceSettings {
    fn default() -> Self {
        MetricsSourceSettings::Static {
            readings: HashMap::new(),
        }
    }
}

impl MetricsSourceSettings {
    pub fn build(&self) -> Result<Arc<dyn MetricsSource>> {
        Ok(match self {
            MetricsSourceSettings::Static { readings } => {
                let source = StaticMetricsSource::new();
                for (instance_id, utilization) in readings {
                    source.set(instance_id.clone(), *utilization);
                }
                Arc::new(source)
            }
            MetricsSourceSettings::Http {
                base_url,
                timeout_secs,
            } => Arc::new(
                HttpMetricsSource::new(base_url, Duration::from_secs(*timeout_secs))
                    .context("Failed to configure HTTP metrics source")?,
            ),
        })
    }
}

/// Compute platform backend. Only the simulated platform is built in.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformSettings {
    /// Describe polls before a simulated stop or start settles
    #[serde(default = "default_transition_polls")]
    pub transition_polls: u32,
    /// Simulated instances: id to initial size class
    #[serde(default)]
    pub instances: HashMap<String, String>,
}

fn default_transition_polls() -> u32 {
    2
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            transition_polls: default_transition_polls(),
            instances: HashMap::new(),
        }
    }
}

impl PlatformSettings {
    pub fn build(&self) -> Arc<dyn ComputePlatform> {
        let platform = SimulatedPlatform::new(self.transition_polls);
        for (instance_id, size_class) in &self.instances {
            platform.add_instance(instance_id.clone(), size_class.clone());
        }
        Arc::new(platform)
    }
}

impl AgentConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("SCALER_CONFIG").unwrap_or_else(|_| "scaler.toml".to_string());
        let config = config::Config::builder()
            .add_source(config::File::new(&path, config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix("SCALER")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        let config: AgentConfig = config
            .try_deserialize()
            .context("Invalid agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document directly
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: AgentConfig = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
            .context("Invalid agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        parse_utc_offset(&self.default_utc_offset)
            .map_err(|e| anyhow::anyhow!("default_utc_offset: {}", e))?;

        let mut seen = HashSet::new();
        for instance in &self.instances {
            if !seen.insert(instance.instance_id.as_str()) {
                bail!("instance {} is configured twice", instance.instance_id);
            }
            instance
                .thresholds
                .validate()
                .map_err(|e| anyhow::anyhow!("instance {}: {}", instance.instance_id, e))?;
        }
        if self.check_interval_secs == 0 || self.dispatch_interval_secs == 0 {
            bail!("check and dispatch intervals must be positive");
        }
        Ok(())
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.instances
            .iter()
            .map(|instance| instance.instance_id.clone())
            .collect()
    }

    /// Notification channel per managed instance
    pub fn channels(&self) -> HashMap<String, String> {
        self.instances
            .iter()
            .map(|instance| {
                (
                    instance.instance_id.clone(),
                    instance.notification_channel.clone(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
api_port = 9000
api_token = "secret"
default_utc_offset = "+08:00"

[executor]
stop_timeout_secs = 120

[executor.retry]
initial_backoff = 500
max_backoff = 4000
max_attempts = 4

[notifier]
kind = "webhook"
url = "http://hooks.internal/resize"

[platform.instances]
"i-0abc" = "m5.large"

[metrics_source]
kind = "static"

[metrics_source.readings]
"i-0abc" = { cpu_pct = 90.0, mem_pct = 40.0 }

[[instances]]
instance_id = "i-0abc"
notification_channel = "ops-alerts"
thresholds = { cpu_upsize = 85.0, cpu_downsize = 20.0, mem_upsize = 85.0, mem_downsize = 20.0 }
ladder = { classes = ["m5.large", "m5.xlarge", "m5.2xlarge"], floor = "m5.large" }
maintenance_window = { time = "02:00", utc_offset = "+08:00" }
"#;

    #[test]
    fn test_parses_full_document() {
        let config = AgentConfig::from_toml(SAMPLE).unwrap();

        assert_eq!(config.api_port, 9000);
        assert_eq!(config.api_token.as_deref(), Some("secret"));
        assert_eq!(config.store_path, "scaler.redb");
        assert_eq!(config.executor.stop_timeout_secs, 120);
        assert_eq!(config.executor.start_timeout_secs, 600);
        assert_eq!(config.executor.retry.max_attempts, 4);
        assert!(matches!(config.notifier, NotifierSettings::Webhook { .. }));
        assert!(matches!(
            config.metrics_source,
            MetricsSourceSettings::Static { .. }
        ));
        assert_eq!(config.instances.len(), 1);
        assert_eq!(config.instances[0].metric_window_secs, 7 * 24 * 60 * 60);
        assert_eq!(
            config.channels().get("i-0abc").map(String::as_str),
            Some("ops-alerts")
        );
    }

    #[test]
    fn test_defaults_apply_to_empty_document() {
        let config = AgentConfig::from_toml("").unwrap();
        assert_eq!(config.api_port, 8080);
        assert!(config.api_token.is_none());
        assert_eq!(config.check_interval_secs, 604_800);
        assert!(config.instances.is_empty());
    }

    #[test]
    fn test_duplicate_instances_rejected() {
        let doubled = format!(
            "{}\n{}",
            SAMPLE,
            &SAMPLE[SAMPLE.find("[[instances]]").unwrap()..]
        );
        assert!(AgentConfig::from_toml(&doubled).is_err());
    }

    #[test]
    fn test_bad_threshold_rejected() {
        let bad = SAMPLE.replace("cpu_upsize = 85.0", "cpu_upsize = 185.0");
        assert!(AgentConfig::from_toml(&bad).is_err());
    }

    #[test]
    fn test_executor_config_conversion() {
        let config = AgentConfig::from_toml(SAMPLE).unwrap();
        let executor = config.executor.executor_config();
        assert_eq!(executor.stop_timeout, Duration::from_secs(120));
        assert_eq!(executor.retry.initial_backoff, Duration::from_millis(500));
    }
}
