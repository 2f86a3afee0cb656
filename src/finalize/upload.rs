//! PDF upload boundary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{FulfillmentBackend, UploadConfig};
use crate::error::FinalizeError;

/// One PDF to deliver to the vendor portal.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub confirmation_code: String,
    pub pdf_path: PathBuf,
    pub customer_email: String,
    pub customer_name: String,
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub upload_url: Option<String>,
    pub message: String,
    pub uploaded_at: DateTime<Utc>,
}

#[async_trait]
pub trait UploadClient: Send + Sync {
    async fn upload_pdf(&self, request: &UploadRequest) -> Result<UploadResult, FinalizeError>;
}

/// Build the configured upload client.
pub fn create_upload_client(config: &UploadConfig) -> Arc<dyn UploadClient> {
    match config.backend {
        FulfillmentBackend::Http => Arc::new(HttpUploadClient::new(config)),
        FulfillmentBackend::Mock => Arc::new(MockUploadClient),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponseBody {
    #[serde(default)]
    upload_url: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Multipart POST to the vendor's `/upload/pdf` endpoint.
pub struct HttpUploadClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpUploadClient {
    pub fn new(config: &UploadConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.expose_secret().to_string(),
        }
    }
}

#[async_trait]
impl UploadClient for HttpUploadClient {
    async fn upload_pdf(&self, request: &UploadRequest) -> Result<UploadResult, FinalizeError> {
        let bytes = tokio::fs::read(&request.pdf_path).await?;
        let file_name = file_name_of(&request.pdf_path);
        debug!(
            code = %request.confirmation_code,
            size = bytes.len(),
            "Uploading PDF"
        );

        let form = reqwest::multipart::Form::new()
            .part(
                "pdf",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name(file_name.clone())
                    .mime_str("application/pdf")
                    .map_err(|e| FinalizeError::Upload {
                        reason: e.to_string(),
                    })?,
            )
            .text("confirmation_code", request.confirmation_code.clone())
            .text("customer_email", request.customer_email.clone())
            .text("customer_name", request.customer_name.clone())
            .text("filename", file_name);

        let response = self
            .http
            .post(format!("{}/upload/pdf", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| FinalizeError::Upload {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FinalizeError::Upload {
                reason: format!("status {status}: {body}"),
            });
        }

        let body: UploadResponseBody =
            response.json().await.map_err(|e| FinalizeError::Upload {
                reason: format!("malformed upload response: {e}"),
            })?;

        info!(code = %request.confirmation_code, url = ?body.upload_url, "PDF uploaded");
        Ok(UploadResult {
            upload_url: body.upload_url,
            message: body.message.unwrap_or_else(|| "Upload successful".into()),
            uploaded_at: Utc::now(),
        })
    }
}

/// Always succeeds with a deterministic URL; never touches the network.
pub struct MockUploadClient;

#[async_trait]
impl UploadClient for MockUploadClient {
    async fn upload_pdf(&self, request: &UploadRequest) -> Result<UploadResult, FinalizeError> {
        // The file must still exist, so tests catch a broken render step.
        if !request.pdf_path.exists() {
            return Err(FinalizeError::Upload {
                reason: format!("PDF file not found: {}", request.pdf_path.display()),
            });
        }
        Ok(UploadResult {
            upload_url: Some(format!(
                "https://uploads.mock.example/{}.pdf",
                request.confirmation_code
            )),
            message: "Upload successful (mock)".into(),
            uploaded_at: Utc::now(),
        })
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document.pdf".into())
}
