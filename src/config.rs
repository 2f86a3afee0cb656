//! Configuration types.
//!
//! Everything is read from the environment exactly once via
//! [`AppConfig::from_env`] at process start; components receive the typed
//! sub-structs and never touch `std::env` themselves.

use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Full application configuration, assembled at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub mailbox: MailboxConfig,
    pub fulfillment: FulfillmentConfig,
    pub upload: UploadConfig,
    pub pdf: PdfConfig,
    pub otp: OtpConfig,
    pub finalize_interval_secs: u64,
    /// When set, the worker also writes daily-rotated log files here.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::from_env(),
            mailbox: MailboxConfig::from_env()?,
            fulfillment: FulfillmentConfig::from_env()?,
            upload: UploadConfig::from_env()?,
            pdf: PdfConfig::from_env(),
            otp: OtpConfig::from_env()?,
            finalize_interval_secs: parse_env("FINALIZE_INTERVAL_SECS", 300)?,
            log_dir: optional_path_env("ESIM_RELAY_LOG_DIR"),
        })
    }
}

/// Local database location.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let path = std::env::var("ESIM_RELAY_DB_PATH")
            .unwrap_or_else(|_| "./data/esim-relay.db".to_string());
        Self {
            path: PathBuf::from(path),
        }
    }
}

/// Mailbox (IMAP) polling configuration.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    pub poll_interval_secs: u64,
    /// Senders accepted by the poll loop. `*` allows everyone,
    /// `@domain.com` / `domain.com` match a domain, full addresses match
    /// exactly. Empty list denies all.
    pub allowed_senders: Vec<String>,
}

impl MailboxConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let imap_host = require_env("IMAP_HOST")?;
        let username = require_env("IMAP_USER")?;
        let password = SecretString::from(require_env("IMAP_PASS")?);

        let allowed_senders: Vec<String> = std::env::var("MAILBOX_ALLOWED_SENDERS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            imap_host,
            imap_port: parse_env("IMAP_PORT", 993)?,
            username,
            password,
            poll_interval_secs: parse_env("MAILBOX_POLL_INTERVAL_SECS", 60)?,
            allowed_senders,
        })
    }
}

/// Which fulfillment client implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfillmentBackend {
    /// Real HTTP API.
    Http,
    /// Deterministic in-process mock, for development and tests.
    Mock,
}

/// External fulfillment API configuration.
#[derive(Debug, Clone)]
pub struct FulfillmentConfig {
    pub backend: FulfillmentBackend,
    pub base_url: String,
    pub api_key: SecretString,
    pub timeout_secs: u64,
}

impl FulfillmentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("FULFILLMENT_PROVIDER").as_deref() {
            Ok("http") => FulfillmentBackend::Http,
            Ok("mock") | Err(_) => FulfillmentBackend::Mock,
            Ok(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "FULFILLMENT_PROVIDER".into(),
                    message: format!("unknown provider '{other}' (expected http or mock)"),
                });
            }
        };

        // The mock backend needs no credentials.
        let (base_url, api_key) = if backend == FulfillmentBackend::Http {
            (
                require_env("FULFILLMENT_BASE_URL")?,
                SecretString::from(require_env("FULFILLMENT_API_KEY")?),
            )
        } else {
            (
                std::env::var("FULFILLMENT_BASE_URL").unwrap_or_default(),
                SecretString::from(std::env::var("FULFILLMENT_API_KEY").unwrap_or_default()),
            )
        };

        Ok(Self {
            backend,
            base_url,
            api_key,
            timeout_secs: parse_env("FULFILLMENT_TIMEOUT_SECS", 15)?,
        })
    }
}

/// PDF upload target configuration.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub backend: FulfillmentBackend,
    pub base_url: String,
    pub api_key: SecretString,
    pub timeout_secs: u64,
}

impl UploadConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("UPLOAD_PROVIDER").as_deref() {
            Ok("http") => FulfillmentBackend::Http,
            Ok("mock") | Err(_) => FulfillmentBackend::Mock,
            Ok(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "UPLOAD_PROVIDER".into(),
                    message: format!("unknown provider '{other}' (expected http or mock)"),
                });
            }
        };

        let (base_url, api_key) = if backend == FulfillmentBackend::Http {
            (
                require_env("UPLOAD_BASE_URL")?,
                SecretString::from(require_env("UPLOAD_API_KEY")?),
            )
        } else {
            (
                std::env::var("UPLOAD_BASE_URL").unwrap_or_default(),
                SecretString::from(std::env::var("UPLOAD_API_KEY").unwrap_or_default()),
            )
        };

        Ok(Self {
            backend,
            base_url,
            api_key,
            timeout_secs: parse_env("UPLOAD_TIMEOUT_SECS", 30)?,
        })
    }
}

/// PDF rendering configuration.
#[derive(Debug, Clone)]
pub struct PdfConfig {
    /// HTML template; a built-in template is used when the file is absent.
    pub template_path: PathBuf,
    pub output_dir: PathBuf,
    /// Headless browser binary. When empty, the mock renderer is used.
    pub chromium_bin: Option<String>,
}

impl PdfConfig {
    pub fn from_env() -> Self {
        Self {
            template_path: PathBuf::from(
                std::env::var("PDF_TEMPLATE_PATH")
                    .unwrap_or_else(|_| "templates/esim.html".to_string()),
            ),
            output_dir: PathBuf::from(
                std::env::var("PDF_OUTPUT_DIR").unwrap_or_else(|_| "data/pdf".to_string()),
            ),
            chromium_bin: std::env::var("PDF_CHROMIUM_BIN")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }
}

/// OTP ledger configuration.
#[derive(Debug, Clone)]
pub struct OtpConfig {
    pub code_length: usize,
    pub expiry_hours: i64,
}

impl OtpConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self {
            code_length: parse_env("OTP_CODE_LENGTH", 6)?,
            expiry_hours: parse_env("OTP_EXPIRY_HOURS", 24)?,
        }
        .validate()
    }

    /// A non-positive expiry would mint codes that are expired on arrival.
    fn validate(self) -> Result<Self, ConfigError> {
        if self.expiry_hours <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "OTP_EXPIRY_HOURS".into(),
                message: format!("must be positive, got {}", self.expiry_hours),
            });
        }
        Ok(self)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn require_env(key: &str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingEnvVar(key.to_string())),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

fn optional_path_env(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otp_expiry_must_be_positive() {
        for hours in [0, -5] {
            let err = OtpConfig {
                code_length: 6,
                expiry_hours: hours,
            }
            .validate()
            .unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "OTP_EXPIRY_HOURS"
            ));
        }
    }

    #[test]
    fn otp_config_accepts_positive_expiry() {
        let config = OtpConfig {
            code_length: 6,
            expiry_hours: 24,
        }
        .validate()
        .unwrap();
        assert_eq!(config.expiry_hours, 24);
    }

    #[test]
    fn log_dir_is_off_by_default() {
        assert!(optional_path_env("ESIM_RELAY_TEST_UNSET_LOG_DIR").is_none());
    }
}
