//! Bank-data aggregator HTTP client
//!
//! `POST /accounts/balance/get` with client credentials and the item's
//! access token. Error bodies carry an `error_code`; `ITEM_LOGIN_REQUIRED`
//! means the user has to relink the bank.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

use super::{AggregatorError, BankAggregator};
use crate::funding::types::AchRelationship;

const ITEM_LOGIN_REQUIRED: &str = "ITEM_LOGIN_REQUIRED";
const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    accounts: Vec<BankAccount>,
}

#[derive(Debug, Deserialize)]
struct BankAccount {
    account_id: String,
    balances: Balances,
}

#[derive(Debug, Deserialize)]
struct Balances {
    available: Option<Decimal>,
    current: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}

pub struct HttpAggregator {
    client: Client,
    base_url: String,
    client_id: String,
    secret: String,
}

impl HttpAggregator {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AggregatorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AggregatorError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            secret: secret.into(),
        })
    }
}

fn classify(status: StatusCode, body: ErrorBody) -> AggregatorError {
    if body.error_code == ITEM_LOGIN_REQUIRED {
        return AggregatorError::ReauthRequired(body.error_message);
    }
    if body.error_code == RATE_LIMIT_EXCEEDED || status == StatusCode::TOO_MANY_REQUESTS {
        return AggregatorError::RateLimited;
    }
    AggregatorError::Unavailable(format!(
        "{} {}: {}",
        status.as_u16(),
        body.error_code,
        body.error_message
    ))
}

#[async_trait]
impl BankAggregator for HttpAggregator {
    async fn get_balance(
        &self,
        relationship: &AchRelationship,
    ) -> Result<Decimal, AggregatorError> {
        let Some(access_token) = relationship.aggregator_access_token.as_deref() else {
            return Err(AggregatorError::ReauthRequired(
                "relationship has no aggregator access token".to_string(),
            ));
        };

        let mut body = json!({
            "client_id": self.client_id,
            "secret": self.secret,
            "access_token": access_token,
        });
        if let Some(account_id) = &relationship.aggregator_account_id {
            body["options"] = json!({ "account_ids": [account_id] });
        }

        let response = self
            .client
            .post(format!("{}/accounts/balance/get", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AggregatorError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error = response.json::<ErrorBody>().await.unwrap_or_default();
            return Err(classify(status, error));
        }

        let parsed: BalanceResponse = response
            .json()
            .await
            .map_err(|e| AggregatorError::Unavailable(e.to_string()))?;

        let account = match &relationship.aggregator_account_id {
            Some(id) => parsed.accounts.iter().find(|a| &a.account_id == id),
            None => parsed.accounts.first(),
        }
        .ok_or_else(|| AggregatorError::Unavailable("bank account not in response".to_string()))?;

        account
            .balances
            .available
            .or(account.balances.current)
            .ok_or_else(|| AggregatorError::Unavailable("no balance reported".to_string()))
    }
}
