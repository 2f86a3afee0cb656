//! esim-relay — email-driven eSIM order relay.
//!
//! Polls a vendor mailbox for purchase-confirmation emails, parses them
//! into orders, delivers order items idempotently to an external
//! fulfillment API, and finalizes provisioned eSIMs (PDF generation,
//! upload, OTP-gated confirmation).

pub mod config;
pub mod error;
pub mod finalize;
pub mod fulfillment;
pub mod mailbox;
pub mod otp;
pub mod parser;
pub mod pipeline;
pub mod store;

pub use error::{Error, Result};
