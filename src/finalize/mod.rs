//! Finalize pipeline — PDF generation, upload, and OTP gating.
//!
//! Runs as a periodic pass over COMPLETED eSIM records. Two guards make
//! concurrent passes safe: the sync ledger (a SUCCESS row for the
//! `globaltix-pdf` target short-circuits straight to DONE) and the
//! conditional status lock (COMPLETED → PROCESS in one atomic statement,
//! only the caller that flipped the row proceeds).

pub mod pdf;
pub mod upload;

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::FinalizeError;
use crate::otp::OtpService;
use crate::store::Database;
use crate::store::model::{EsimDetailRow, EsimStatus, SyncLogEntry, SyncStatus};

pub use pdf::{ChromiumRenderer, MockPdfRenderer, PdfRenderer, PdfService, create_renderer};
pub use upload::{
    HttpUploadClient, MockUploadClient, UploadClient, UploadRequest, UploadResult,
    create_upload_client,
};

/// Ledger key for the finalize leg.
pub const FINALIZE_TARGET_SERVICE: &str = "globaltix-pdf";

/// What happened to one eSIM record during a finalize pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// PDF generated and uploaded; waiting for an admin to confirm the OTP.
    AwaitingConfirmation { otp_code: String },
    /// The ledger already recorded SUCCESS; fast-forwarded to DONE.
    AlreadyFinalized,
    /// Lock not acquired or record unusable; nothing was done.
    Skipped,
}

pub struct FinalizePipeline {
    db: Arc<dyn Database>,
    pdf: PdfService,
    upload: Arc<dyn UploadClient>,
    otp: OtpService,
}

impl FinalizePipeline {
    pub fn new(
        db: Arc<dyn Database>,
        pdf: PdfService,
        upload: Arc<dyn UploadClient>,
        otp: OtpService,
    ) -> Self {
        Self {
            db,
            pdf,
            upload,
            otp,
        }
    }

    /// One pass over records awaiting finalize. Per-record failures are
    /// recorded and never stop the scan. Returns the number of records
    /// that reached PENDING_CONFIRMATION or DONE.
    pub async fn run(&self, limit: usize) -> Result<usize, FinalizeError> {
        let pending = self.db.find_pending_upload(limit).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        info!(count = pending.len(), "Finalize pass started");

        let mut advanced = 0;
        for esim in &pending {
            match self.process_one(esim).await {
                Ok(FinalizeOutcome::Skipped) => {}
                Ok(_) => advanced += 1,
                Err(e) => {
                    error!(esim_id = %esim.id, error = %e, "Finalize failed for record");
                }
            }
        }
        Ok(advanced)
    }

    /// Finalize one record. See the module docs for the guard order.
    pub async fn process_one(
        &self,
        esim: &EsimDetailRow,
    ) -> Result<FinalizeOutcome, FinalizeError> {
        let Some(item) = self.db.find_item_by_id(&esim.order_item_id).await? else {
            warn!(esim_id = %esim.id, item_id = %esim.order_item_id, "Order item missing");
            return Ok(FinalizeOutcome::Skipped);
        };

        // Ledger short-circuit: a previous pass finished the work but may
        // have crashed before flipping the record.
        if self
            .db
            .is_already_synced(&item.confirmation_code, FINALIZE_TARGET_SERVICE)
            .await?
        {
            info!(code = %item.confirmation_code, "Already finalized, fast-forwarding");
            self.db.mark_esim_done(&esim.id).await?;
            self.db.mark_item_completed(&esim.order_item_id).await?;
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }

        // Lock: losing the race is not an error, another worker has it.
        if !self.db.mark_as_finalizing(&esim.id).await? {
            return Ok(FinalizeOutcome::Skipped);
        }

        match self.finalize_locked(esim, &item).await {
            Ok(otp_code) => Ok(FinalizeOutcome::AwaitingConfirmation { otp_code }),
            Err(e) => {
                self.db
                    .upsert_sync_log(&SyncLogEntry {
                        confirmation_code: item.confirmation_code.clone(),
                        reference_number: item.reference_number.clone(),
                        target_service: FINALIZE_TARGET_SERVICE.to_string(),
                        request_payload: serde_json::json!({}),
                        response_payload: None,
                        status: SyncStatus::Failed,
                        error_message: Some(e.to_string()),
                    })
                    .await?;
                // FAILED releases the lock for the retry driver.
                self.db
                    .update_esim_status(&esim.id, EsimStatus::Failed)
                    .await?;
                Err(e)
            }
        }
    }

    /// The fallible middle: render, upload, gate with an OTP, record.
    async fn finalize_locked(
        &self,
        esim: &EsimDetailRow,
        item: &crate::store::model::OrderItemDetail,
    ) -> Result<String, FinalizeError> {
        let pdf_path = self.pdf.generate(esim, &item.reference_number).await?;

        let upload_result = self
            .upload
            .upload_pdf(&UploadRequest {
                confirmation_code: item.confirmation_code.clone(),
                pdf_path: pdf_path.clone(),
                customer_email: item.customer_email.clone(),
                customer_name: item.customer_name.clone(),
            })
            .await?;

        let otp = self
            .otp
            .create_otp(
                &item.order_id,
                &esim.order_item_id,
                &item.confirmation_code,
                &pdf_path.to_string_lossy(),
            )
            .await
            .map_err(|e| FinalizeError::Upload {
                reason: format!("OTP creation failed: {e}"),
            })?;

        if let Some(url) = &upload_result.upload_url {
            self.db
                .update_otp_upload_result(
                    &otp.id,
                    url,
                    &serde_json::json!({ "message": upload_result.message }),
                )
                .await?;
        }

        self.db
            .update_pdf_upload_info(
                &esim.id,
                &pdf_path.to_string_lossy(),
                upload_result.uploaded_at,
            )
            .await?;

        self.db
            .upsert_sync_log(&SyncLogEntry {
                confirmation_code: item.confirmation_code.clone(),
                reference_number: item.reference_number.clone(),
                target_service: FINALIZE_TARGET_SERVICE.to_string(),
                request_payload: serde_json::json!({
                    "pdfPath": pdf_path.to_string_lossy(),
                }),
                response_payload: Some(serde_json::json!({
                    "file": pdf_path.to_string_lossy(),
                    "uploadUrl": upload_result.upload_url,
                    "uploadedAt": upload_result.uploaded_at.to_rfc3339(),
                    "otpGenerated": true,
                })),
                status: SyncStatus::Success,
                error_message: None,
            })
            .await?;

        self.db
            .update_esim_status(&esim.id, EsimStatus::PendingConfirmation)
            .await?;

        info!(
            code = %item.confirmation_code,
            otp = %otp.otp_code,
            "Finalized, awaiting OTP confirmation"
        );
        Ok(otp.otp_code)
    }

    /// Admin confirmation: validates and consumes the OTP, then flips the
    /// eSIM to DONE and completes the order item.
    pub async fn confirm_upload(
        &self,
        otp_code: &str,
        confirmed_by: &str,
    ) -> Result<(), FinalizeError> {
        // Resolve the record before consuming the OTP: a missing record
        // must not burn the code.
        let pending = self
            .db
            .find_otp_by_code(otp_code)
            .await?
            .ok_or_else(|| FinalizeError::Upload {
                reason: "OTP not found".into(),
            })?;
        let esim = self
            .db
            .find_esim_by_order_item(&pending.order_item_id)
            .await?
            .ok_or_else(|| FinalizeError::RecordNotFound {
                id: pending.order_item_id.clone(),
            })?;

        let otp = self
            .otp
            .confirm(otp_code, confirmed_by)
            .await
            .map_err(|e| FinalizeError::Upload {
                reason: e.to_string(),
            })?;

        self.db.confirm_pdf_upload(&esim.id).await?;
        self.db.mark_item_completed(&otp.order_item_id).await?;
        info!(code = %otp.confirmation_code, "Upload confirmed, record DONE");
        Ok(())
    }
}
