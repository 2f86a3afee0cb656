//! Upload OTP ledger service.
//!
//! Every finalized PDF upload is gated by a one-time numeric code that a
//! human confirms out of band. Confirmation is the only human-triggered
//! mutation in the pipeline.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::Rng;
use tracing::{info, warn};

use crate::config::OtpConfig;
use crate::error::OtpError;
use crate::store::Database;
use crate::store::model::{NewUploadOtp, OtpStatus, UploadOtp};

/// Outcome of checking a submitted code.
#[derive(Debug, Clone)]
pub enum OtpValidation {
    Valid(UploadOtp),
    Invalid { reason: String },
}

pub struct OtpService {
    db: Arc<dyn Database>,
    config: OtpConfig,
}

impl OtpService {
    pub fn new(db: Arc<dyn Database>, config: OtpConfig) -> Self {
        Self { db, config }
    }

    /// Create a PENDING OTP for one upload. Retries code generation on the
    /// rare collision with an existing code.
    pub async fn create_otp(
        &self,
        order_id: &str,
        order_item_id: &str,
        confirmation_code: &str,
        pdf_file_path: &str,
    ) -> Result<UploadOtp, OtpError> {
        let expires_at = Utc::now() + Duration::hours(self.config.expiry_hours);

        for _ in 0..5 {
            let otp = NewUploadOtp {
                order_id: order_id.to_string(),
                order_item_id: order_item_id.to_string(),
                confirmation_code: confirmation_code.to_string(),
                otp_code: generate_code(self.config.code_length),
                expires_at,
                pdf_file_path: pdf_file_path.to_string(),
            };
            match self.db.insert_otp(&otp).await {
                Ok(created) => {
                    info!(code = %confirmation_code, "OTP created");
                    return Ok(created);
                }
                Err(crate::error::DatabaseError::Constraint(_)) => {
                    warn!("OTP code collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(OtpError::Rejected {
            reason: "Could not generate a unique OTP code".into(),
        })
    }

    /// Validate a submitted code without consuming it.
    ///
    /// A PENDING row past its expiry is lazily flipped to EXPIRED here, so
    /// reads stay correct even between bulk sweeps.
    pub async fn validate(&self, otp_code: &str) -> Result<OtpValidation, OtpError> {
        let Some(otp) = self.db.find_otp_by_code(otp_code).await? else {
            return Ok(OtpValidation::Invalid {
                reason: "OTP not found".into(),
            });
        };

        match otp.status {
            OtpStatus::Pending => {
                if otp.expires_at <= Utc::now() {
                    self.db
                        .update_otp_status(&otp.id, OtpStatus::Expired)
                        .await?;
                    Ok(OtpValidation::Invalid {
                        reason: "OTP expired".into(),
                    })
                } else {
                    Ok(OtpValidation::Valid(otp))
                }
            }
            OtpStatus::Expired => Ok(OtpValidation::Invalid {
                reason: "OTP expired".into(),
            }),
            OtpStatus::Confirmed | OtpStatus::Failed => Ok(OtpValidation::Invalid {
                reason: "OTP already used".into(),
            }),
        }
    }

    /// Confirm a code at most once, recording who confirmed it.
    pub async fn confirm(&self, otp_code: &str, confirmed_by: &str) -> Result<UploadOtp, OtpError> {
        match self.validate(otp_code).await? {
            OtpValidation::Valid(otp) => {
                self.db.confirm_otp_row(&otp.id, confirmed_by).await?;
                info!(code = %otp.confirmation_code, by = %confirmed_by, "OTP confirmed");
                let confirmed = self
                    .db
                    .find_otp_by_code(otp_code)
                    .await?
                    .ok_or(OtpError::Rejected {
                        reason: "OTP not found".into(),
                    })?;
                Ok(confirmed)
            }
            OtpValidation::Invalid { reason } => Err(OtpError::Rejected { reason }),
        }
    }

    /// All PENDING, unexpired OTPs.
    pub async fn get_pending(&self) -> Result<Vec<UploadOtp>, OtpError> {
        Ok(self.db.get_pending_otps().await?)
    }

    /// Bulk sweep: flip stale PENDING rows to EXPIRED. Returns the count.
    pub async fn expire_old(&self) -> Result<usize, OtpError> {
        let count = self.db.expire_old_otps().await?;
        if count > 0 {
            info!(count, "Expired stale OTPs");
        }
        Ok(count)
    }
}

/// Fixed-length numeric code.
fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from_digit(rng.gen_range(0..10), 10).unwrap_or('0'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    fn test_config() -> OtpConfig {
        OtpConfig {
            code_length: 6,
            expiry_hours: 24,
        }
    }

    async fn service() -> (OtpService, Arc<LibSqlBackend>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (OtpService::new(db.clone(), test_config()), db)
    }

    #[test]
    fn generated_codes_are_numeric_and_sized() {
        for _ in 0..50 {
            let code = generate_code(6);
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn create_and_validate_round_trip() {
        let (service, _db) = service().await;
        let otp = service
            .create_otp("order-1", "item-1", "CODE600", "/tmp/CODE600.pdf")
            .await
            .unwrap();
        assert_eq!(otp.status, OtpStatus::Pending);
        assert_eq!(otp.otp_code.len(), 6);

        match service.validate(&otp.otp_code).await.unwrap() {
            OtpValidation::Valid(found) => assert_eq!(found.id, otp.id),
            OtpValidation::Invalid { reason } => panic!("unexpected rejection: {reason}"),
        }
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let (service, _db) = service().await;
        match service.validate("000000").await.unwrap() {
            OtpValidation::Invalid { reason } => assert_eq!(reason, "OTP not found"),
            OtpValidation::Valid(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn confirm_is_at_most_once() {
        let (service, _db) = service().await;
        let otp = service
            .create_otp("order-1", "item-1", "CODE601", "/tmp/CODE601.pdf")
            .await
            .unwrap();

        let confirmed = service.confirm(&otp.otp_code, "Admin Jo").await.unwrap();
        assert_eq!(confirmed.status, OtpStatus::Confirmed);
        assert_eq!(confirmed.confirmed_by.as_deref(), Some("Admin Jo"));

        let err = service.confirm(&otp.otp_code, "Admin Jo").await.unwrap_err();
        match err {
            OtpError::Rejected { reason } => assert_eq!(reason, "OTP already used"),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_code_is_rejected_lazily() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let service = OtpService::new(
            db.clone(),
            OtpConfig {
                code_length: 6,
                expiry_hours: -1,
            },
        );

        let otp = service
            .create_otp("order-1", "item-1", "CODE602", "/tmp/CODE602.pdf")
            .await
            .unwrap();

        match service.validate(&otp.otp_code).await.unwrap() {
            OtpValidation::Invalid { reason } => assert_eq!(reason, "OTP expired"),
            OtpValidation::Valid(_) => panic!("expected expiry"),
        }

        // The lazy path persisted the flip.
        let row = db.find_otp_by_code(&otp.otp_code).await.unwrap().unwrap();
        assert_eq!(row.status, OtpStatus::Expired);
    }

    #[tokio::test]
    async fn pending_listing_and_sweep() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let fresh = OtpService::new(db.clone(), test_config());
        let stale = OtpService::new(
            db.clone(),
            OtpConfig {
                code_length: 6,
                expiry_hours: -1,
            },
        );

        fresh
            .create_otp("order-1", "item-1", "CODE603", "/tmp/a.pdf")
            .await
            .unwrap();
        stale
            .create_otp("order-1", "item-2", "CODE604", "/tmp/b.pdf")
            .await
            .unwrap();

        assert_eq!(fresh.expire_old().await.unwrap(), 1);
        let pending = fresh.get_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].confirmation_code, "CODE603");
    }
}
