//! External fulfillment API boundary and the delivery sync service.
//!
//! The payload and response shapes are the locked contract with the
//! fulfillment partner; field names are camelCase on the wire.

pub mod client;
pub mod mock;
mod sync;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{FulfillmentBackend, FulfillmentConfig};
use crate::error::SyncError;

pub use client::HttpFulfillmentClient;
pub use mock::MockFulfillmentClient;
pub use sync::{SyncOutcome, SyncService, TARGET_SERVICE};

/// One order item, as delivered to the fulfillment API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload {
    pub confirmation_code: String,
    pub reference_number: String,
    pub purchase_date: Option<String>,
    pub customer: CustomerPayload,
    pub product: ProductPayload,
    pub payment_status: Option<String>,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomerPayload {
    pub name: String,
    pub email: String,
    pub alternative_email: Option<String>,
    pub mobile_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductPayload {
    pub name: String,
    pub variant: Option<String>,
    pub sku: String,
    pub visit_date: Option<String>,
    pub quantity: i64,
    pub unit_price: Option<i64>,
}

/// Fulfillment API response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<IssuedEsim>,
}

/// Provisioned eSIM details returned on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedEsim {
    pub product_name: String,
    pub iccid: String,
    pub qr_code: String,
    pub smdp_address: String,
    pub activation_code: String,
    pub combined_activation: String,
    #[serde(default)]
    pub apn: Option<ApnDetails>,
    #[serde(default)]
    pub valid_from: Option<String>,
    #[serde(default)]
    pub valid_until: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApnDetails {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Delivery boundary. The idempotency key is the confirmation code, so the
/// partner can collapse duplicate deliveries on their side as well.
#[async_trait]
pub trait FulfillmentClient: Send + Sync {
    async fn issue_esim(
        &self,
        payload: &OrderPayload,
        idempotency_key: &str,
    ) -> Result<IssueResponse, SyncError>;
}

/// Build the configured client implementation. Selected once at startup.
pub fn create_client(config: &FulfillmentConfig) -> Arc<dyn FulfillmentClient> {
    match config.backend {
        FulfillmentBackend::Http => Arc::new(HttpFulfillmentClient::new(config)),
        FulfillmentBackend::Mock => Arc::new(MockFulfillmentClient::new()),
    }
}
