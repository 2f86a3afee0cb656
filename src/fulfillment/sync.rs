//! Delivery sync service — the critical idempotent path.
//!
//! Every attempt, success or failure, lands in the sync ledger keyed by
//! (confirmation code, target service). A SUCCESS row short-circuits all
//! later sends, which is what makes re-polling the same email safe.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::SyncError;
use crate::fulfillment::{CustomerPayload, FulfillmentClient, OrderPayload, ProductPayload};
use crate::store::Database;
use crate::store::model::{
    EsimStatus, NewEsimDetail, OrderItemDetail, SyncLogEntry, SyncStatus,
};

/// Ledger key for deliveries to the fulfillment partner.
pub const TARGET_SERVICE: &str = "third-party-service";

/// What happened to one confirmation code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Delivered on this call; the eSIM record id is the ledger's proof.
    Delivered { esim_id: String },
    /// A SUCCESS ledger row already existed; nothing was sent.
    AlreadySynced,
}

pub struct SyncService {
    db: Arc<dyn Database>,
    client: Arc<dyn FulfillmentClient>,
}

impl SyncService {
    pub fn new(db: Arc<dyn Database>, client: Arc<dyn FulfillmentClient>) -> Self {
        Self { db, client }
    }

    /// Deliver one order item by confirmation code.
    ///
    /// No-op if the ledger already records SUCCESS for this code. On a
    /// successful delivery the provisioning result is persisted (idempotent
    /// by ICCID), the record is marked COMPLETED, and a SUCCESS ledger row
    /// is written. On failure a FAILED ledger row is written and the error
    /// re-raised.
    pub async fn send_item(&self, confirmation_code: &str) -> Result<SyncOutcome, SyncError> {
        if self
            .db
            .is_already_synced(confirmation_code, TARGET_SERVICE)
            .await?
        {
            return Ok(SyncOutcome::AlreadySynced);
        }

        let item = self
            .db
            .find_item_by_confirmation_code(confirmation_code)
            .await?
            .ok_or_else(|| SyncError::ItemNotFound {
                confirmation_code: confirmation_code.to_string(),
            })?;

        let payload = build_payload(&item);

        match self.client.issue_esim(&payload, confirmation_code).await {
            Ok(response) => {
                let issued = match (response.success, response.data.as_ref()) {
                    (true, Some(data)) => data.clone(),
                    _ => {
                        let err = SyncError::InvalidResponse {
                            reason: response
                                .message
                                .clone()
                                .unwrap_or_else(|| "success=false or missing data".into()),
                        };
                        self.record_failure(&payload, &err).await?;
                        return Err(err);
                    }
                };

                let esim_id = self
                    .db
                    .insert_provisioning(&NewEsimDetail {
                        order_item_id: item.order_item_id.clone(),
                        product_name: issued.product_name.clone(),
                        valid_from: issued.valid_from.clone(),
                        valid_until: issued.valid_until.clone(),
                        iccid: issued.iccid.clone(),
                        qr_code: issued.qr_code.clone(),
                        smdp_address: issued.smdp_address.clone(),
                        activation_code: issued.activation_code.clone(),
                        combined_activation: issued.combined_activation.clone(),
                        apn_name: issued.apn.as_ref().and_then(|a| a.name.clone()),
                        apn_username: issued.apn.as_ref().and_then(|a| a.username.clone()),
                        apn_password: issued.apn.as_ref().and_then(|a| a.password.clone()),
                    })
                    .await?;
                self.db
                    .update_esim_status(&esim_id, EsimStatus::Completed)
                    .await?;

                self.db
                    .upsert_sync_log(&SyncLogEntry {
                        confirmation_code: confirmation_code.to_string(),
                        reference_number: payload.reference_number.clone(),
                        target_service: TARGET_SERVICE.to_string(),
                        request_payload: serde_json::to_value(&payload)
                            .unwrap_or(serde_json::Value::Null),
                        response_payload: serde_json::to_value(&response).ok(),
                        status: SyncStatus::Success,
                        error_message: None,
                    })
                    .await?;

                info!(code = %confirmation_code, iccid = %issued.iccid, "Item delivered");
                Ok(SyncOutcome::Delivered { esim_id })
            }
            Err(err) => {
                self.record_failure(&payload, &err).await?;
                Err(err)
            }
        }
    }

    /// Deliver several items sequentially. One failure never blocks the
    /// rest, and earlier successes are never rolled back.
    pub async fn send_multiple(
        &self,
        confirmation_codes: &[String],
    ) -> Vec<(String, Result<SyncOutcome, SyncError>)> {
        let mut outcomes = Vec::with_capacity(confirmation_codes.len());
        for code in confirmation_codes {
            let result = self.send_item(code).await;
            if let Err(e) = &result {
                warn!(code = %code, error = %e, "Item delivery failed");
            }
            outcomes.push((code.clone(), result));
        }
        outcomes
    }

    async fn record_failure(
        &self,
        payload: &OrderPayload,
        err: &SyncError,
    ) -> Result<(), SyncError> {
        self.db
            .upsert_sync_log(&SyncLogEntry {
                confirmation_code: payload.confirmation_code.clone(),
                reference_number: payload.reference_number.clone(),
                target_service: TARGET_SERVICE.to_string(),
                request_payload: serde_json::to_value(payload)
                    .unwrap_or(serde_json::Value::Null),
                response_payload: None,
                status: SyncStatus::Failed,
                error_message: Some(err.to_string()),
            })
            .await?;
        Ok(())
    }
}

/// The canonical payload is built from the order/item join, never from the
/// parsed email, so retries see the latest persisted state.
fn build_payload(item: &OrderItemDetail) -> OrderPayload {
    OrderPayload {
        confirmation_code: item.confirmation_code.clone(),
        reference_number: item.reference_number.clone(),
        purchase_date: item.purchase_date.map(|d| d.to_rfc3339()),
        customer: CustomerPayload {
            name: item.customer_name.clone(),
            email: item.customer_email.clone(),
            alternative_email: item.alternative_email.clone(),
            mobile_number: item.mobile_number.clone(),
        },
        product: ProductPayload {
            name: item.product_name.clone(),
            variant: item.product_variant.clone(),
            sku: item.sku.clone(),
            visit_date: item.visit_date.map(|d| d.to_rfc3339()),
            quantity: item.quantity,
            unit_price: item.unit_price,
        },
        payment_status: item.payment_status.clone(),
        remarks: item.remarks.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fulfillment::{IssueResponse, MockFulfillmentClient};
    use crate::store::LibSqlBackend;
    use crate::store::model::{NewOrder, NewOrderItem};
    use async_trait::async_trait;

    struct FailingClient;

    #[async_trait]
    impl FulfillmentClient for FailingClient {
        async fn issue_esim(
            &self,
            payload: &OrderPayload,
            _idempotency_key: &str,
        ) -> Result<IssueResponse, SyncError> {
            Err(SyncError::Delivery {
                confirmation_code: payload.confirmation_code.clone(),
                reason: "connection refused".into(),
            })
        }
    }

    async fn seeded_db(codes: &[&str]) -> Arc<LibSqlBackend> {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let items: Vec<NewOrderItem> = codes
            .iter()
            .map(|code| NewOrderItem {
                confirmation_code: (*code).to_string(),
                product_name: "eSIM Japan 8 Days".into(),
                product_variant: Some("WM-JP-08-5GB".into()),
                sku: "WM-JP-08-5GB".into(),
                visit_date: None,
                quantity: 1,
                unit_price: Some(180_000),
            })
            .collect();
        db.upsert_order_with_items(
            &NewOrder {
                reference_number: "REF500".into(),
                purchase_date: None,
                reseller_name: None,
                customer_name: "Jane Tan".into(),
                customer_email: "jane@example.com".into(),
                alternative_email: None,
                mobile_number: None,
                payment_status: Some("Paid".into()),
                remarks: None,
            },
            &items,
        )
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn successful_delivery_persists_esim_and_ledger() {
        let db = seeded_db(&["SYNCOK01"]).await;
        let service = SyncService::new(db.clone(), Arc::new(MockFulfillmentClient::new()));

        let outcome = service.send_item("SYNCOK01").await.unwrap();
        let SyncOutcome::Delivered { esim_id } = outcome else {
            panic!("expected Delivered");
        };

        let esim = db.find_esim(&esim_id).await.unwrap().unwrap();
        assert_eq!(esim.status, EsimStatus::Completed);

        let log = db
            .find_sync_log("SYNCOK01", TARGET_SERVICE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, SyncStatus::Success);
        assert!(log.response_payload.is_some());
    }

    #[tokio::test]
    async fn second_send_is_a_silent_noop() {
        let db = seeded_db(&["SYNCOK02"]).await;
        let service = SyncService::new(db.clone(), Arc::new(MockFulfillmentClient::new()));

        service.send_item("SYNCOK02").await.unwrap();
        let outcome = service.send_item("SYNCOK02").await.unwrap();
        assert_eq!(outcome, SyncOutcome::AlreadySynced);

        let log = db
            .find_sync_log("SYNCOK02", TARGET_SERVICE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.attempt_count, 1);
    }

    #[tokio::test]
    async fn unknown_code_is_an_error_without_ledger_row() {
        let db = seeded_db(&[]).await;
        let service = SyncService::new(db.clone(), Arc::new(MockFulfillmentClient::new()));

        let err = service.send_item("NOSUCH01").await.unwrap_err();
        assert!(matches!(err, SyncError::ItemNotFound { .. }));
        assert!(
            db.find_sync_log("NOSUCH01", TARGET_SERVICE)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn failed_delivery_writes_failed_ledger_then_retry_succeeds() {
        let db = seeded_db(&["SYNCRT01"]).await;

        let failing = SyncService::new(db.clone(), Arc::new(FailingClient));
        let err = failing.send_item("SYNCRT01").await.unwrap_err();
        assert!(matches!(err, SyncError::Delivery { .. }));

        let log = db
            .find_sync_log("SYNCRT01", TARGET_SERVICE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, SyncStatus::Failed);
        assert!(log.error_message.is_some());

        let working = SyncService::new(db.clone(), Arc::new(MockFulfillmentClient::new()));
        working.send_item("SYNCRT01").await.unwrap();

        let log = db
            .find_sync_log("SYNCRT01", TARGET_SERVICE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, SyncStatus::Success);
        assert_eq!(log.attempt_count, 2);
    }

    #[tokio::test]
    async fn send_multiple_continues_past_failures() {
        let db = seeded_db(&["MULTI001", "MULTI002"]).await;
        let service = SyncService::new(db.clone(), Arc::new(MockFulfillmentClient::new()));

        let codes = vec![
            "MULTI001".to_string(),
            "MISSING0".to_string(),
            "MULTI002".to_string(),
        ];
        let outcomes = service.send_multiple(&codes).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].1.is_ok());
        assert!(outcomes[1].1.is_err());
        assert!(outcomes[2].1.is_ok(), "failure must not block later items");
    }
}
