//! Clearing-broker HTTP client
//!
//! Broker API with HTTP basic auth (key / secret):
//! - `POST /v1/accounts/{account}/ach_relationships`
//! - `POST /v1/accounts/{account}/transfers`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::{
    BrokerError, ClearingBroker, RelationshipReceipt, RelationshipRequest, TransferReceipt,
    TransferRequest,
};

pub struct HttpClearingBroker {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl HttpClearingBroker {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Broker request");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .json(body)
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BrokerError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(BrokerError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| BrokerError::Decode(e.to_string()))
}

#[async_trait]
impl ClearingBroker for HttpClearingBroker {
    async fn create_relationship(
        &self,
        request: &RelationshipRequest,
    ) -> Result<RelationshipReceipt, BrokerError> {
        let body = serde_json::to_value(request).map_err(|e| BrokerError::Decode(e.to_string()))?;
        self.post(
            &format!("/v1/accounts/{}/ach_relationships", request.broker_account_id),
            &body,
        )
        .await
    }

    async fn create_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, BrokerError> {
        let body = json!({
            "transfer_type": "ach",
            "relationship_id": request.relationship_id,
            "amount": request.amount.to_string(),
            "direction": request.direction.broker_code(),
        });
        self.post(
            &format!("/v1/accounts/{}/transfers", request.broker_account_id),
            &body,
        )
        .await
    }
}
