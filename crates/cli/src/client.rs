//! API client for the scaling agent

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The agent answered with an error body
    #[error("{message} ({status}, {code})")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
    },
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// API client for the scaling agent
pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str, token: Option<String>) -> ClientResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let base_url = Url::parse(base_url)?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> ClientResult<RequestBuilder> {
        let url = self.base_url.join(path)?;
        let builder = self.client.request(method, url);
        Ok(match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(error) => (error.code, error.error),
            Err(_) => ("http_error".to_string(), body),
        };
        Err(ClientError::Api {
            status,
            code,
            message,
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let response = self.request(Method::GET, path)?.send().await?;
        Self::parse(response).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> ClientResult<T> {
        let mut builder = self.request(Method::POST, path)?;
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Self::parse(builder.send().await?).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let response = self.request(Method::DELETE, path)?.send().await?;
        Self::parse(response).await
    }

    pub async fn schedule(&self, request: &ScheduleRequest) -> ClientResult<ScheduleCreated> {
        self.post("api/v1/schedules", Some(request)).await
    }

    pub async fn cancel(&self, instance_id: &str) -> ClientResult<CancelResponse> {
        self.delete(&format!("api/v1/schedules/{}", instance_id))
            .await
    }

    pub async fn current(&self, instance_id: &str) -> ClientResult<ScheduleRecord> {
        self.get(&format!("api/v1/schedules/{}", instance_id)).await
    }

    pub async fn history(&self, instance_id: &str) -> ClientResult<Vec<ScheduleRecord>> {
        self.get(&format!("api/v1/schedules/{}/history", instance_id))
            .await
    }

    pub async fn check(&self, instance_id: &str) -> ClientResult<CheckReport> {
        self.post::<_, ()>(&format!("api/v1/checks/{}", instance_id), None)
            .await
    }

    /// Fetch `/healthz`; an unhealthy agent answers 503 with the same body
    pub async fn health(&self) -> ClientResult<HealthReport> {
        let response = self.request(Method::GET, "healthz")?.send().await?;
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return Ok(response.json().await?);
        }
        Self::parse(response).await
    }
}

// API request and response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub instance_id: String,
    pub target_size_class: String,
    pub execution_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleCreated {
    pub schedule_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub schedule_id: String,
    pub instance_id: String,
    pub target_size_class: String,
    pub execution_time: String,
    pub created_at: String,
    pub updated_at: String,
    pub state: String,
    pub source: String,
    #[serde(default)]
    pub claimed_at: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub result: Option<OutcomeStatus>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub outcome: String,
    #[serde(default)]
    pub schedule_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
    pub window_secs: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    pub instance_id: String,
    pub current_size_class: String,
    pub sample: Sample,
    pub decision: Decision,
    #[serde(default)]
    pub schedule_id: Option<String>,
    #[serde(default)]
    pub execution_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}
