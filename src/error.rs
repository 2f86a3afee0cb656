//! Error types for the relay.

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Finalize error: {0}")]
    Finalize(#[from] FinalizeError),

    #[error("OTP error: {0}")]
    Otp(#[from] OtpError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Invalid status transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mailbox (IMAP) collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("IMAP login rejected for {username}")]
    LoginFailed { username: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fulfillment delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Order item not found: {confirmation_code}")]
    ItemNotFound { confirmation_code: String },

    #[error("Delivery failed for {confirmation_code}: {reason}")]
    Delivery {
        confirmation_code: String,
        reason: String,
    },

    #[error("Invalid fulfillment response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Finalize pipeline errors (PDF generation, upload).
#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("eSIM record not found: {id}")]
    RecordNotFound { id: String },

    #[error("PDF generation failed: {reason}")]
    Pdf { reason: String },

    #[error("PDF upload failed: {reason}")]
    Upload { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// OTP ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum OtpError {
    #[error("OTP rejected: {reason}")]
    Rejected { reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
