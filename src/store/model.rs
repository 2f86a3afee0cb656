//! Row types and status state machines for the persistence layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order lifecycle. RECEIVED → PROCESSING → COMPLETED, FAILED from any
/// non-terminal state. COMPLETED and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Received,
    Processing,
    Completed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "PROCESSING" => Self::Processing,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            _ => Self::Received,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Received => false,
            Self::Processing => *self == Self::Received,
            Self::Completed => *self == Self::Processing,
            Self::Failed => true,
        }
    }
}

/// Sync ledger outcome. SUCCESS is sticky: once recorded for a
/// (confirmation code, target service) pair it can never be overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "SUCCESS" => Self::Success,
            _ => Self::Failed,
        }
    }
}

/// eSIM record lifecycle.
///
/// PENDING → PROCESS (provisioning requested) → COMPLETED (artifact inputs
/// available) → PENDING_CONFIRMATION (PDF uploaded, awaiting OTP) →
/// DONE | FAILED. FAILED records are re-entered by the retry driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EsimStatus {
    Pending,
    Process,
    Completed,
    PendingConfirmation,
    Done,
    Failed,
}

impl EsimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Process => "PROCESS",
            Self::Completed => "COMPLETED",
            Self::PendingConfirmation => "PENDING_CONFIRMATION",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "PROCESS" => Self::Process,
            "COMPLETED" => Self::Completed,
            "PENDING_CONFIRMATION" => Self::PendingConfirmation,
            "DONE" => Self::Done,
            "FAILED" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Upload OTP lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OtpStatus {
    Pending,
    Confirmed,
    Expired,
    Failed,
}

impl OtpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Expired => "EXPIRED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "CONFIRMED" => Self::Confirmed,
            "EXPIRED" => Self::Expired,
            "FAILED" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

// ── Orders ──────────────────────────────────────────────────────────

/// Order fields as extracted from a purchase email, keyed by reference
/// number. Re-ingesting the same reference overwrites mutable fields.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub reference_number: String,
    pub purchase_date: Option<DateTime<Utc>>,
    pub reseller_name: Option<String>,
    pub customer_name: String,
    pub customer_email: String,
    pub alternative_email: Option<String>,
    pub mobile_number: Option<String>,
    pub payment_status: Option<String>,
    pub remarks: Option<String>,
}

/// Order line fields, keyed by confirmation code.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrderItem {
    pub confirmation_code: String,
    pub product_name: String,
    pub product_variant: Option<String>,
    pub sku: String,
    pub visit_date: Option<DateTime<Utc>>,
    pub quantity: i64,
    pub unit_price: Option<i64>,
}

/// A persisted order row.
#[derive(Debug, Clone)]
pub struct OrderRow {
    pub id: String,
    pub reference_number: String,
    pub purchase_date: Option<DateTime<Utc>>,
    pub reseller_name: Option<String>,
    pub customer_name: String,
    pub customer_email: String,
    pub alternative_email: Option<String>,
    pub mobile_number: Option<String>,
    pub payment_status: Option<String>,
    pub remarks: Option<String>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One order item joined with its parent order — the canonical read model
/// consumed by the fulfillment sync service and the finalize pipeline.
#[derive(Debug, Clone)]
pub struct OrderItemDetail {
    pub order_item_id: String,
    pub order_id: String,
    pub confirmation_code: String,
    pub reference_number: String,
    pub purchase_date: Option<DateTime<Utc>>,
    pub customer_name: String,
    pub customer_email: String,
    pub alternative_email: Option<String>,
    pub mobile_number: Option<String>,
    pub payment_status: Option<String>,
    pub remarks: Option<String>,
    pub product_name: String,
    pub product_variant: Option<String>,
    pub sku: String,
    pub visit_date: Option<DateTime<Utc>>,
    pub quantity: i64,
    pub unit_price: Option<i64>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Sync ledger ─────────────────────────────────────────────────────

/// One write to the idempotency ledger.
#[derive(Debug, Clone)]
pub struct SyncLogEntry {
    pub confirmation_code: String,
    pub reference_number: String,
    pub target_service: String,
    pub request_payload: serde_json::Value,
    pub response_payload: Option<serde_json::Value>,
    pub status: SyncStatus,
    pub error_message: Option<String>,
}

/// A persisted ledger row.
#[derive(Debug, Clone)]
pub struct SyncLogRow {
    pub id: String,
    pub confirmation_code: String,
    pub reference_number: String,
    pub target_service: String,
    pub request_payload: serde_json::Value,
    pub response_payload: Option<serde_json::Value>,
    pub status: SyncStatus,
    pub error_message: Option<String>,
    pub attempt_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── eSIM records ────────────────────────────────────────────────────

/// Provisioning result to persist, keyed by ICCID so duplicate provisioning
/// responses collapse into one row.
#[derive(Debug, Clone)]
pub struct NewEsimDetail {
    pub order_item_id: String,
    pub product_name: String,
    pub valid_from: Option<String>,
    pub valid_until: Option<String>,
    pub iccid: String,
    pub qr_code: String,
    pub smdp_address: String,
    pub activation_code: String,
    pub combined_activation: String,
    pub apn_name: Option<String>,
    pub apn_username: Option<String>,
    pub apn_password: Option<String>,
}

/// A persisted eSIM record.
#[derive(Debug, Clone)]
pub struct EsimDetailRow {
    pub id: String,
    pub order_item_id: String,
    pub product_name: String,
    pub valid_from: Option<String>,
    pub valid_until: Option<String>,
    pub iccid: String,
    pub qr_code: String,
    pub smdp_address: String,
    pub activation_code: String,
    pub combined_activation: String,
    pub apn_name: Option<String>,
    pub apn_username: Option<String>,
    pub apn_password: Option<String>,
    pub status: EsimStatus,
    pub pdf_file_path: Option<String>,
    pub pdf_uploaded_at: Option<DateTime<Utc>>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Upload OTPs ─────────────────────────────────────────────────────

/// New OTP row gating one finalize attempt.
#[derive(Debug, Clone)]
pub struct NewUploadOtp {
    pub order_id: String,
    pub order_item_id: String,
    pub confirmation_code: String,
    pub otp_code: String,
    pub expires_at: DateTime<Utc>,
    pub pdf_file_path: String,
}

/// A persisted OTP row.
#[derive(Debug, Clone)]
pub struct UploadOtp {
    pub id: String,
    pub order_id: String,
    pub order_item_id: String,
    pub confirmation_code: String,
    pub otp_code: String,
    pub expires_at: DateTime<Utc>,
    pub pdf_file_path: String,
    pub upload_url: Option<String>,
    pub status: OtpStatus,
    pub confirmed_by: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_roundtrip() {
        for s in [
            OrderStatus::Received,
            OrderStatus::Processing,
            OrderStatus::Completed,
            OrderStatus::Failed,
        ] {
            assert_eq!(OrderStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn order_status_transitions() {
        assert!(OrderStatus::Received.can_transition_to(OrderStatus::Processing));
        assert!(OrderStatus::Processing.can_transition_to(OrderStatus::Completed));
        assert!(OrderStatus::Received.can_transition_to(OrderStatus::Failed));
        assert!(OrderStatus::Processing.can_transition_to(OrderStatus::Failed));

        // Terminal states stay terminal.
        assert!(!OrderStatus::Completed.can_transition_to(OrderStatus::Failed));
        assert!(!OrderStatus::Failed.can_transition_to(OrderStatus::Processing));
        // No skipping RECEIVED → COMPLETED.
        assert!(!OrderStatus::Received.can_transition_to(OrderStatus::Completed));
    }

    #[test]
    fn esim_status_roundtrip() {
        for s in [
            EsimStatus::Pending,
            EsimStatus::Process,
            EsimStatus::Completed,
            EsimStatus::PendingConfirmation,
            EsimStatus::Done,
            EsimStatus::Failed,
        ] {
            assert_eq!(EsimStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn otp_status_roundtrip() {
        for s in [
            OtpStatus::Pending,
            OtpStatus::Confirmed,
            OtpStatus::Expired,
            OtpStatus::Failed,
        ] {
            assert_eq!(OtpStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn unknown_status_strings_fall_back() {
        assert_eq!(OrderStatus::parse("garbage"), OrderStatus::Received);
        assert_eq!(SyncStatus::parse("garbage"), SyncStatus::Failed);
        assert_eq!(EsimStatus::parse("garbage"), EsimStatus::Pending);
        assert_eq!(OtpStatus::parse("garbage"), OtpStatus::Pending);
    }
}
