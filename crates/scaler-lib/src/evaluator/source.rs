//! Utilization sources
//!
//! `HttpMetricsSource` reads from a metrics service over HTTP.
//! `StaticMetricsSource` serves fixed readings, used by the simulated
//! backend and in tests.

use super::{MetricsSource, MetricsSourceError};
use async_trait::async_trait;
use crate::error::EvaluationError;
use crate::models::{MetricSample, Utilization};
use dashmap::DashMap;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Read one sample and classify failures.
///
/// A source that errors, or answers with neither CPU nor memory, yields
/// `MetricUnavailable`.
pub async fn read_sample(
    source: &dyn MetricsSource,
    instance_id: &str,
    window: Duration,
) -> Result<MetricSample, EvaluationError> {
    let utilization = source.utilization(instance_id, window).await.map_err(|e| {
        warn!(instance_id = %instance_id, error = %e, "Failed to read utilization");
        EvaluationError::MetricUnavailable {
            instance_id: instance_id.to_string(),
            reason: e.to_string(),
        }
    })?;

    if utilization.cpu_pct.is_none() && utilization.mem_pct.is_none() {
        return Err(EvaluationError::MetricUnavailable {
            instance_id: instance_id.to_string(),
            reason: "source returned no datapoints".to_string(),
        });
    }

    Ok(MetricSample::new(utilization, window.as_secs()))
}

/// Fetches `{cpu_pct, mem_pct}` JSON from a metrics HTTP endpoint
pub struct HttpMetricsSource {
    client: Client,
    base_url: Url,
}

impl HttpMetricsSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MetricsSourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MetricsSourceError(format!("failed to create HTTP client: {}", e)))?;
        let base_url = Url::parse(base_url)
            .map_err(|e| MetricsSourceError(format!("invalid metrics URL {}: {}", base_url, e)))?;
        Ok(Self { client, base_url })
    }

    fn utilization_url(&self, instance_id: &str, window: Duration) -> Result<Url, MetricsSourceError> {
        let mut url = self
            .base_url
            .join(&format!("instances/{}/utilization", instance_id))
            .map_err(|e| MetricsSourceError(format!("invalid path: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("window_secs", &window.as_secs().to_string());
        Ok(url)
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn utilization(
        &self,
        instance_id: &str,
        window: Duration,
    ) -> Result<Utilization, MetricsSourceError> {
        let url = self.utilization_url(instance_id, window)?;
        debug!(url = %url, "Fetching utilization");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MetricsSourceError(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(MetricsSourceError(format!(
                "metrics endpoint answered {}",
                response.status()
            )));
        }

        response
            .json::<Utilization>()
            .await
            .map_err(|e| MetricsSourceError(format!("invalid utilization payload: {}", e)))
    }
}

/// In-memory source with fixed readings per instance
#[derive(Default)]
pub struct StaticMetricsSource {
    readings: DashMap<String, Utilization>,
}

impl StaticMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, instance_id: impl Into<String>, utilization: Utilization) {
        self.readings.insert(instance_id.into(), utilization);
    }
}

#[async_trait]
impl MetricsSource for StaticMetricsSource {
    async fn utilization(
        &self,
        instance_id: &str,
        _window: Duration,
    ) -> Result<Utilization, MetricsSourceError> {
        self.readings
            .get(instance_id)
            .map(|r| *r)
            .ok_or_else(|| MetricsSourceError(format!("no readings for {}", instance_id)))
    }
}
