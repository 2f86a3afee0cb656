//! HTTP fulfillment client.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::time::Duration;
use tracing::debug;

use crate::config::FulfillmentConfig;
use crate::error::SyncError;
use crate::fulfillment::{FulfillmentClient, IssueResponse, OrderPayload};

/// POSTs order payloads to the partner's `/orders` endpoint with bearer
/// auth and an `Idempotency-Key` header. Any non-2xx status is an error.
pub struct HttpFulfillmentClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpFulfillmentClient {
    pub fn new(config: &FulfillmentConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.expose_secret().to_string(),
        }
    }
}

#[async_trait]
impl FulfillmentClient for HttpFulfillmentClient {
    async fn issue_esim(
        &self,
        payload: &OrderPayload,
        idempotency_key: &str,
    ) -> Result<IssueResponse, SyncError> {
        let url = format!("{}/orders", self.base_url);
        debug!(code = %payload.confirmation_code, %url, "Delivering order item");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| SyncError::Delivery {
                confirmation_code: payload.confirmation_code.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Delivery {
                confirmation_code: payload.confirmation_code.clone(),
                reason: format!("status {status}: {body}"),
            });
        }

        response
            .json::<IssueResponse>()
            .await
            .map_err(|e| SyncError::InvalidResponse {
                reason: e.to_string(),
            })
    }
}
