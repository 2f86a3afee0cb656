//! Retry drivers.
//!
//! Both passes are safe to run at any time, from any number of processes:
//! re-sending leans on the sticky-SUCCESS ledger, re-queueing only flips
//! FAILED records back to COMPLETED so the next finalize pass picks them
//! up behind its own lock.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Error;
use crate::fulfillment::{SyncService, TARGET_SERVICE};
use crate::store::Database;
use crate::store::model::EsimStatus;

/// Summary of one retry pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub recovered: usize,
}

pub struct RetryDriver {
    db: Arc<dyn Database>,
    sync: SyncService,
}

impl RetryDriver {
    pub fn new(db: Arc<dyn Database>, sync: SyncService) -> Self {
        Self { db, sync }
    }

    /// Re-send every confirmation code with a FAILED fulfillment ledger
    /// row. Codes that fail again stay FAILED for the next pass.
    pub async fn retry_failed_syncs(&self, limit: usize) -> Result<RetryReport, Error> {
        let failed = self
            .db
            .get_failed_sync_logs(Some(TARGET_SERVICE), limit)
            .await?;
        if failed.is_empty() {
            return Ok(RetryReport::default());
        }
        info!(count = failed.len(), "Retrying failed deliveries");

        let mut report = RetryReport {
            attempted: failed.len(),
            recovered: 0,
        };
        for log in &failed {
            match self.sync.send_item(&log.confirmation_code).await {
                Ok(_) => report.recovered += 1,
                Err(e) => {
                    warn!(code = %log.confirmation_code, error = %e, "Retry failed");
                }
            }
        }
        Ok(report)
    }

    /// Re-queue FAILED eSIM records for the finalize pass by flipping them
    /// back to COMPLETED. Returns how many were re-armed.
    pub async fn requeue_failed_esims(&self, limit: usize) -> Result<usize, Error> {
        let failed = self.db.find_failed_esims(limit).await?;
        for esim in &failed {
            self.db
                .update_esim_status(&esim.id, EsimStatus::Completed)
                .await?;
        }
        if !failed.is_empty() {
            info!(count = failed.len(), "Re-queued failed eSIM records");
        }
        Ok(failed.len())
    }
}
