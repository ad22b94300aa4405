//! HTTP publisher
//!
//! Pushes events to a real-time gateway (`POST {base}/publish` with
//! `{channel, data}`), authenticated with an API key header.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{EventPublisher, PublishError, StreamEvent, account_topic};
use crate::core_types::AccountId;

pub struct HttpPublisher {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpPublisher {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PublishError> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .build()
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl EventPublisher for HttpPublisher {
    async fn publish(
        &self,
        account_id: AccountId,
        event: &StreamEvent,
    ) -> Result<(), PublishError> {
        let body = json!({
            "channel": account_topic(account_id),
            "data": event,
        });

        let response = self
            .client
            .post(format!("{}/publish", self.base_url))
            .header("X-API-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected { status, message });
        }
        Ok(())
    }
}
