use super::{NotificationMessage, NotificationTransport};
use async_trait::async_trait;
use crate::error::TransportError;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Writes notifications to the log stream
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn publish(
        &self,
        channel: &str,
        message: &NotificationMessage,
    ) -> Result<(), TransportError> {
        info!(
            event = "notification",
            channel = %channel,
            subject = %message.subject,
            message = %message.body,
            "Notification published"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    channel: &'a str,
    subject: &'a str,
    message: &'a str,
}

/// Posts notifications as JSON to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct WebhookTransport {
    client: reqwest::Client,
    url: Url,
}

impl WebhookTransport {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::Permanent(format!("invalid webhook url {}: {}", url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Permanent(format!("failed to build client: {}", e)))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl NotificationTransport for WebhookTransport {
    async fn publish(
        &self,
        channel: &str,
        message: &NotificationMessage,
    ) -> Result<(), TransportError> {
        let payload = WebhookPayload {
            channel,
            subject: &message.subject,
            message: &message.body,
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    TransportError::Permanent(e.to_string())
                } else {
                    TransportError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(channel = %channel, %status, "Webhook accepted notification");
            Ok(())
        } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(TransportError::Transient(format!("webhook returned {}", status)))
        } else {
            Err(TransportError::Permanent(format!("webhook returned {}", status)))
        }
    }
}
