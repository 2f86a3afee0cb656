//! In-process mock fulfillment client.
//!
//! Deterministic: the ICCID and activation material are derived from the
//! confirmation code, so repeated deliveries of the same item provision
//! the same eSIM. Used for local development and tests.

use std::hash::{DefaultHasher, Hash, Hasher};

use async_trait::async_trait;
use tracing::debug;

use crate::error::SyncError;
use crate::fulfillment::{
    ApnDetails, FulfillmentClient, IssueResponse, IssuedEsim, OrderPayload,
};

const MOCK_SMDP: &str = "smdp.mock.example";

#[derive(Default)]
pub struct MockFulfillmentClient;

impl MockFulfillmentClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FulfillmentClient for MockFulfillmentClient {
    async fn issue_esim(
        &self,
        payload: &OrderPayload,
        idempotency_key: &str,
    ) -> Result<IssueResponse, SyncError> {
        debug!(
            code = %payload.confirmation_code,
            sku = %payload.product.sku,
            key = %idempotency_key,
            "Issuing mock eSIM"
        );

        let mut hasher = DefaultHasher::new();
        payload.confirmation_code.hash(&mut hasher);
        let seed = hasher.finish();

        let iccid = format!("8962{:016}", seed % 10_000_000_000_000_000);
        let activation_code = format!("MOCK-{}-{:06}", payload.product.sku, seed % 1_000_000);
        let combined = format!("LPA:1${MOCK_SMDP}${activation_code}");

        Ok(IssueResponse {
            success: true,
            message: Some("issued (mock)".into()),
            data: Some(IssuedEsim {
                product_name: payload.product.name.clone(),
                iccid,
                qr_code: combined.clone(),
                smdp_address: MOCK_SMDP.into(),
                activation_code,
                combined_activation: combined,
                apn: Some(ApnDetails {
                    name: Some("internet".into()),
                    username: None,
                    password: None,
                }),
                valid_from: payload.product.visit_date.clone(),
                valid_until: None,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fulfillment::{CustomerPayload, ProductPayload};

    fn payload(code: &str) -> OrderPayload {
        OrderPayload {
            confirmation_code: code.into(),
            reference_number: "REF1".into(),
            purchase_date: None,
            customer: CustomerPayload {
                name: "Jane".into(),
                email: "jane@example.com".into(),
                alternative_email: None,
                mobile_number: None,
            },
            product: ProductPayload {
                name: "eSIM Japan 8 Days".into(),
                variant: None,
                sku: "WM-JP-08-5GB".into(),
                visit_date: None,
                quantity: 1,
                unit_price: None,
            },
            payment_status: None,
            remarks: None,
        }
    }

    #[tokio::test]
    async fn same_code_provisions_same_esim() {
        let client = MockFulfillmentClient::new();
        let a = client.issue_esim(&payload("GTMSRLOW"), "GTMSRLOW").await.unwrap();
        let b = client.issue_esim(&payload("GTMSRLOW"), "GTMSRLOW").await.unwrap();

        let (a, b) = (a.data.unwrap(), b.data.unwrap());
        assert_eq!(a.iccid, b.iccid);
        assert_eq!(a.activation_code, b.activation_code);
    }

    #[tokio::test]
    async fn different_codes_provision_different_esims() {
        let client = MockFulfillmentClient::new();
        let a = client.issue_esim(&payload("CODE0001"), "CODE0001").await.unwrap();
        let b = client.issue_esim(&payload("CODE0002"), "CODE0002").await.unwrap();
        assert_ne!(a.data.unwrap().iccid, b.data.unwrap().iccid);
    }
}
