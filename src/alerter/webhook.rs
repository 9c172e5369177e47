use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::WebhookConfig;
use crate::error::{MonitorError, Result};
use crate::types::AlertRecord;
use super::{ChannelKind, NotificationChannel};

/// Custom webhook alert channel
pub struct WebhookChannel {
    url: String,
    headers: HashMap<String, String>,
    hostname: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(config: &WebhookConfig, hostname: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MonitorError::config(format!("webhook client: {}", e)))?;

        Ok(Self {
            url: config.url.clone(),
            headers: config.headers.clone(),
            hostname: hostname.to_string(),
            client,
        })
    }
}

pub(crate) fn payload(alert: &AlertRecord, hostname: &str) -> serde_json::Value {
    json!({
        "id": alert.id.to_string(),
        "hostname": hostname,
        "level": alert.level.to_string(),
        "state": alert.state.as_str(),
        "metric": &alert.metric,
        "dedup_key": &alert.dedup_key,
        "value": alert.observed_value,
        "message": &alert.message,
        "created_at": alert.created_at.to_rfc3339(),
        "last_fired_at": alert.last_fired_at.to_rfc3339(),
        "resolved_at": alert.resolved_at.map(|t| t.to_rfc3339()),
        "fire_count": alert.fire_count,
        "repeat_count": alert.repeat_count,
    })
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str { "webhook" }

    fn kind(&self) -> ChannelKind { ChannelKind::Webhook }

    async fn send(&self, alert: &AlertRecord) -> Result<()> {
        let mut req = self.client.post(&self.url).json(&payload(alert, &self.hostname));
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }

        req.send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| MonitorError::delivery("webhook", e))?;
        Ok(())
    }
}
