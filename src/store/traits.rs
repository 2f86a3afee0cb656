//! Unified `Database` trait — single async interface for all persistence.
//!
//! Covers the order store, the sync ledger, the eSIM record store, and the
//! upload OTP ledger. The two concurrency-control primitives live here:
//! the sticky-SUCCESS ledger upsert and the conditional finalize lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::store::model::{
    EsimDetailRow, EsimStatus, NewEsimDetail, NewOrder, NewOrderItem, NewUploadOtp,
    OrderItemDetail, OrderRow, OrderStatus, OtpStatus, SyncLogEntry, SyncLogRow, UploadOtp,
};

/// Backend-agnostic database trait covering the whole pipeline state.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Orders ──────────────────────────────────────────────────────

    /// Upsert an order and all of its items in one transaction.
    ///
    /// Keyed by reference number (order) and confirmation code (items);
    /// calling twice with identical input leaves exactly one row each.
    /// Any item failure rolls back the whole batch. Returns the order id.
    async fn upsert_order_with_items(
        &self,
        order: &NewOrder,
        items: &[NewOrderItem],
    ) -> Result<String, DatabaseError>;

    /// Get an order by id.
    async fn get_order(&self, id: &str) -> Result<Option<OrderRow>, DatabaseError>;

    /// Get an order by its vendor reference number.
    async fn get_order_by_reference(
        &self,
        reference_number: &str,
    ) -> Result<Option<OrderRow>, DatabaseError>;

    /// Transition an order's status, validating the state machine.
    async fn update_order_status(
        &self,
        id: &str,
        status: OrderStatus,
    ) -> Result<(), DatabaseError>;

    /// Look up one item (joined with its parent order) by confirmation code.
    async fn find_item_by_confirmation_code(
        &self,
        confirmation_code: &str,
    ) -> Result<Option<OrderItemDetail>, DatabaseError>;

    /// Look up one item (joined with its parent order) by row id.
    async fn find_item_by_id(&self, id: &str) -> Result<Option<OrderItemDetail>, DatabaseError>;

    /// Mark an item completed. When every sibling item is completed the
    /// parent order is flipped to COMPLETED as well.
    async fn mark_item_completed(&self, item_id: &str) -> Result<(), DatabaseError>;

    // ── Sync ledger ─────────────────────────────────────────────────

    /// Insert or update the ledger row for (confirmation code, target
    /// service). SUCCESS is sticky: a row that already reads SUCCESS is
    /// never modified, and attempt_count only increments on real writes.
    async fn upsert_sync_log(&self, entry: &SyncLogEntry) -> Result<(), DatabaseError>;

    /// True iff a SUCCESS row exists for the pair.
    async fn is_already_synced(
        &self,
        confirmation_code: &str,
        target_service: &str,
    ) -> Result<bool, DatabaseError>;

    /// Latest attempt for the pair, if any.
    async fn find_sync_log(
        &self,
        confirmation_code: &str,
        target_service: &str,
    ) -> Result<Option<SyncLogRow>, DatabaseError>;

    /// FAILED rows, oldest first, optionally scoped to one target service.
    async fn get_failed_sync_logs(
        &self,
        target_service: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncLogRow>, DatabaseError>;

    // ── eSIM records ────────────────────────────────────────────────

    /// Persist a provisioning result, idempotent by ICCID. Returns the id
    /// of the row holding that ICCID (new or pre-existing).
    async fn insert_provisioning(&self, esim: &NewEsimDetail) -> Result<String, DatabaseError>;

    /// Get an eSIM record by id.
    async fn find_esim(&self, id: &str) -> Result<Option<EsimDetailRow>, DatabaseError>;

    /// Get the eSIM record for an order item, if provisioned.
    async fn find_esim_by_order_item(
        &self,
        order_item_id: &str,
    ) -> Result<Option<EsimDetailRow>, DatabaseError>;

    /// Unconditional status update.
    async fn update_esim_status(&self, id: &str, status: EsimStatus)
    -> Result<(), DatabaseError>;

    /// Conditional finalize lock: COMPLETED → PROCESS in one atomic
    /// statement. Returns whether this caller acquired the lock. Racing
    /// callers on the same id see exactly one `true`.
    async fn mark_as_finalizing(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Terminal success: status DONE plus activation timestamp.
    async fn mark_esim_done(&self, id: &str) -> Result<(), DatabaseError>;

    /// OTP-confirmed upload: PENDING_CONFIRMATION → DONE with the
    /// confirmation timestamp recorded.
    async fn confirm_pdf_upload(&self, id: &str) -> Result<(), DatabaseError>;

    /// Record where the generated PDF lives and when it was uploaded.
    async fn update_pdf_upload_info(
        &self,
        id: &str,
        pdf_file_path: &str,
        uploaded_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// COMPLETED records awaiting finalize, oldest update first.
    async fn find_pending_upload(&self, limit: usize) -> Result<Vec<EsimDetailRow>, DatabaseError>;

    /// Terminal DONE records, most recent first.
    async fn find_done(&self) -> Result<Vec<EsimDetailRow>, DatabaseError>;

    /// Records past provisioning but not yet DONE (COMPLETED or
    /// PENDING_CONFIRMATION).
    async fn find_completed_but_not_done(&self) -> Result<Vec<EsimDetailRow>, DatabaseError>;

    /// FAILED records eligible for a retry pass.
    async fn find_failed_esims(&self, limit: usize) -> Result<Vec<EsimDetailRow>, DatabaseError>;

    // ── Upload OTPs ─────────────────────────────────────────────────

    /// Insert a new PENDING OTP row. Returns the stored row.
    async fn insert_otp(&self, otp: &NewUploadOtp) -> Result<UploadOtp, DatabaseError>;

    /// Look up an OTP by its numeric code.
    async fn find_otp_by_code(&self, otp_code: &str) -> Result<Option<UploadOtp>, DatabaseError>;

    /// Unconditional status update (used by the lazy expiry path).
    async fn update_otp_status(&self, id: &str, status: OtpStatus) -> Result<(), DatabaseError>;

    /// Set CONFIRMED plus confirming identity and timestamp.
    async fn confirm_otp_row(&self, id: &str, confirmed_by: &str) -> Result<(), DatabaseError>;

    /// Record the upload URL and raw upload response for audit.
    async fn update_otp_upload_result(
        &self,
        id: &str,
        upload_url: &str,
        response: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// PENDING, unexpired OTPs, newest first.
    async fn get_pending_otps(&self) -> Result<Vec<UploadOtp>, DatabaseError>;

    /// Bulk sweep: flip stale PENDING rows to EXPIRED. Returns the count.
    async fn expire_old_otps(&self) -> Result<usize, DatabaseError>;
}
