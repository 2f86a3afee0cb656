//! Email ingest workflow.
//!
//! One inbound message travels: parse → transactional upsert → acknowledge
//! → deliver items → order PROCESSING. The acknowledge sits after the
//! upsert on purpose: a crash in between re-delivers the email, and the
//! upsert keys plus the sync ledger absorb the duplicate.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Error;
use crate::fulfillment::SyncService;
use crate::mailbox::{Mailbox, NewMessage};
use crate::parser::{self, ParsedOrder, RawEmail};
use crate::store::Database;
use crate::store::model::{NewOrder, NewOrderItem, OrderStatus};

/// What one inbound message produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Order upserted; counts of delivered and failed items.
    Processed {
        order_id: String,
        delivered: usize,
        failed: usize,
    },
    /// Not a purchase confirmation; acknowledged and dropped.
    Rejected,
}

pub struct IngestPipeline {
    db: Arc<dyn Database>,
    mailbox: Arc<dyn Mailbox>,
    sync: SyncService,
}

impl IngestPipeline {
    pub fn new(db: Arc<dyn Database>, mailbox: Arc<dyn Mailbox>, sync: SyncService) -> Self {
        Self { db, mailbox, sync }
    }

    pub async fn handle_message(&self, msg: &NewMessage) -> Result<IngestOutcome, Error> {
        let raw = RawEmail {
            sender: msg.sender.clone(),
            subject: msg.subject.clone(),
            text: msg.text.clone(),
            html: msg.html.clone(),
        };

        let Some(parsed) = parser::parse_order(&raw) else {
            // A definitive rejection is acknowledged too, otherwise the
            // same non-order email comes back on every poll.
            self.acknowledge(msg.uid).await;
            return Ok(IngestOutcome::Rejected);
        };

        let (order, items) = to_rows(&parsed);
        let order_id = self.db.upsert_order_with_items(&order, &items).await?;
        info!(
            reference = %parsed.reference_number,
            items = items.len(),
            "Order upserted"
        );

        // The order is durable; safe to stop the email from reappearing.
        self.acknowledge(msg.uid).await;

        let codes: Vec<String> = items.iter().map(|i| i.confirmation_code.clone()).collect();
        let outcomes = self.sync.send_multiple(&codes).await;
        let failed = outcomes.iter().filter(|(_, r)| r.is_err()).count();
        let delivered = outcomes.len() - failed;

        // Re-ingested emails may find the order past RECEIVED already.
        let current = self.db.get_order(&order_id).await?;
        if current.is_some_and(|o| o.status == OrderStatus::Received) {
            self.db
                .update_order_status(&order_id, OrderStatus::Processing)
                .await?;
        }

        Ok(IngestOutcome::Processed {
            order_id,
            delivered,
            failed,
        })
    }

    async fn acknowledge(&self, uid: u32) {
        // Ack failures are not fatal: the dedup set and the upsert keys
        // absorb the re-delivery on the next poll.
        if let Err(e) = self.mailbox.acknowledge(uid).await {
            warn!(uid, error = %e, "Failed to acknowledge message");
        }
    }
}

fn to_rows(parsed: &ParsedOrder) -> (NewOrder, Vec<NewOrderItem>) {
    let order = NewOrder {
        reference_number: parsed.reference_number.clone(),
        purchase_date: parsed.purchase_date,
        reseller_name: parsed.reseller_name.clone(),
        customer_name: parsed.customer_name.clone(),
        customer_email: parsed.customer_email.clone(),
        alternative_email: parsed.alternative_email.clone(),
        mobile_number: parsed.mobile_number.clone(),
        payment_status: parsed.payment_status.clone(),
        remarks: None,
    };
    let items = parsed
        .items
        .iter()
        .map(|i| NewOrderItem {
            confirmation_code: i.confirmation_code.clone(),
            product_name: i.product_name.clone(),
            product_variant: i.product_variant.clone(),
            sku: i.sku.clone(),
            visit_date: i.visit_date,
            quantity: i.quantity,
            unit_price: i.unit_price,
        })
        .collect();
    (order, items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MailboxError;
    use crate::fulfillment::{MockFulfillmentClient, TARGET_SERVICE};
    use crate::store::LibSqlBackend;
    use crate::store::model::SyncStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records acknowledgements; poll is never used by the ingest path.
    #[derive(Default)]
    struct RecordingMailbox {
        acked: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Mailbox for RecordingMailbox {
        async fn poll(&self) -> Result<Vec<NewMessage>, MailboxError> {
            Ok(Vec::new())
        }

        async fn acknowledge(&self, uid: u32) -> Result<(), MailboxError> {
            self.acked.lock().unwrap().push(uid);
            Ok(())
        }
    }

    const ORDER_EMAIL: &str = "\
Reference Number: ZRPQG8VEGT
Purchase Date: 2026-08-25
Customer Name: Jane Tan
Customer Email: jane@example.com
Payment Collection Status: Paid

Confirmation Code: GTMSRLOW
eSIM Australia & New Zealand 15 Days WM-AUNZ-15-10GB
Quantity: 1
IDR 250.000
";

    fn message(uid: u32, subject: &str, text: &str) -> NewMessage {
        NewMessage {
            uid,
            message_id: format!("<msg-{uid}@vendor.example>"),
            sender: "orders@vendor.example".into(),
            subject: subject.into(),
            text: text.into(),
            html: String::new(),
        }
    }

    async fn pipeline() -> (IngestPipeline, Arc<LibSqlBackend>, Arc<RecordingMailbox>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mailbox = Arc::new(RecordingMailbox::default());
        let sync = SyncService::new(db.clone(), Arc::new(MockFulfillmentClient::new()));
        (
            IngestPipeline::new(db.clone(), mailbox.clone(), sync),
            db,
            mailbox,
        )
    }

    #[tokio::test]
    async fn order_email_is_persisted_delivered_and_acked() {
        let (pipeline, db, mailbox) = pipeline().await;

        let outcome = pipeline
            .handle_message(&message(7, "Your ticket order", ORDER_EMAIL))
            .await
            .unwrap();

        let IngestOutcome::Processed {
            order_id,
            delivered,
            failed,
        } = outcome
        else {
            panic!("expected Processed");
        };
        assert_eq!(delivered, 1);
        assert_eq!(failed, 0);

        let order = db.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Processing);

        let log = db
            .find_sync_log("GTMSRLOW", TARGET_SERVICE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, SyncStatus::Success);

        assert_eq!(*mailbox.acked.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn non_order_email_is_acked_and_dropped() {
        let (pipeline, db, mailbox) = pipeline().await;

        let outcome = pipeline
            .handle_message(&message(8, "Weekly newsletter", "nothing to see"))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Rejected);
        assert_eq!(*mailbox.acked.lock().unwrap(), vec![8]);
        assert!(db.get_order_by_reference("ZRPQG8VEGT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_is_fully_idempotent() {
        let (pipeline, db, _mailbox) = pipeline().await;

        let first = pipeline
            .handle_message(&message(9, "ticket order", ORDER_EMAIL))
            .await
            .unwrap();
        let second = pipeline
            .handle_message(&message(10, "ticket order", ORDER_EMAIL))
            .await
            .unwrap();

        let (IngestOutcome::Processed { order_id: id1, .. },
             IngestOutcome::Processed { order_id: id2, .. }) = (first, second)
        else {
            panic!("expected Processed twice");
        };
        assert_eq!(id1, id2);

        // Exactly one delivery reached the partner.
        let log = db
            .find_sync_log("GTMSRLOW", TARGET_SERVICE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, SyncStatus::Success);
        assert_eq!(log.attempt_count, 1);
    }
}
