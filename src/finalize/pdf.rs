//! PDF generation for finalized eSIMs.
//!
//! The template is plain HTML with `{{FIELD}}` placeholders; substitution
//! happens here. Rendering HTML to PDF is behind the `PdfRenderer` trait:
//! the shipped implementation shells out to headless Chromium, the mock
//! writes a placeholder file so tests never need a browser.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::PdfConfig;
use crate::error::FinalizeError;
use crate::store::model::EsimDetailRow;

/// Built-in fallback used when the configured template file is absent.
const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <style>
    body { font-family: sans-serif; margin: 40px; }
    h1 { font-size: 20px; }
    table { border-collapse: collapse; width: 100%; }
    td { border: 1px solid #ccc; padding: 8px 12px; }
    td:first-child { font-weight: bold; width: 40%; }
  </style>
</head>
<body>
  <h1>{{PRODUCT_NAME}}</h1>
  <table>
    <tr><td>Valid From</td><td>{{VALID_FROM}}</td></tr>
    <tr><td>Valid Until</td><td>{{VALID_UNTIL}}</td></tr>
    <tr><td>ICCID</td><td>{{ICCID}}</td></tr>
    <tr><td>QR Code</td><td>{{QR_CODE}}</td></tr>
    <tr><td>SM-DP+ Address</td><td>{{SMDP_ADDRESS}}</td></tr>
    <tr><td>Activation Code</td><td>{{ACTIVATION_CODE}}</td></tr>
    <tr><td>Combined Activation</td><td>{{COMBINED_ACTIVATION}}</td></tr>
    <tr><td>APN</td><td>{{APN_NAME}}</td></tr>
    <tr><td>APN Username</td><td>{{APN_USERNAME}}</td></tr>
    <tr><td>APN Password</td><td>{{APN_PASSWORD}}</td></tr>
  </table>
</body>
</html>
"#;

/// HTML-to-PDF boundary.
#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render(&self, html: &str, output: &Path) -> Result<(), FinalizeError>;
}

/// Renders via a headless Chromium subprocess.
pub struct ChromiumRenderer {
    bin: String,
}

impl ChromiumRenderer {
    pub fn new(bin: String) -> Self {
        Self { bin }
    }
}

#[async_trait]
impl PdfRenderer for ChromiumRenderer {
    async fn render(&self, html: &str, output: &Path) -> Result<(), FinalizeError> {
        // Chromium only reads from a file, so the filled template is staged
        // next to the output and removed afterwards.
        let html_path = output.with_extension("html");
        tokio::fs::write(&html_path, html).await?;

        let result = tokio::process::Command::new(&self.bin)
            .arg("--headless")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg(format!("--print-to-pdf={}", output.display()))
            .arg(&html_path)
            .output()
            .await;
        let _ = tokio::fs::remove_file(&html_path).await;

        let output_result = result.map_err(|e| FinalizeError::Pdf {
            reason: format!("failed to launch {}: {e}", self.bin),
        })?;
        if !output_result.status.success() {
            return Err(FinalizeError::Pdf {
                reason: format!(
                    "{} exited with {}: {}",
                    self.bin,
                    output_result.status,
                    String::from_utf8_lossy(&output_result.stderr)
                ),
            });
        }
        Ok(())
    }
}

/// Writes a placeholder file instead of a real PDF.
#[derive(Default)]
pub struct MockPdfRenderer;

#[async_trait]
impl PdfRenderer for MockPdfRenderer {
    async fn render(&self, html: &str, output: &Path) -> Result<(), FinalizeError> {
        let placeholder = format!("%PDF-1.4\n% mock render, {} bytes of html\n", html.len());
        tokio::fs::write(output, placeholder).await?;
        Ok(())
    }
}

/// Build the configured renderer.
pub fn create_renderer(config: &PdfConfig) -> Arc<dyn PdfRenderer> {
    match &config.chromium_bin {
        Some(bin) => Arc::new(ChromiumRenderer::new(bin.clone())),
        None => Arc::new(MockPdfRenderer),
    }
}

/// Generates one PDF per eSIM record, named `{reference}_{iccid}.pdf`.
pub struct PdfService {
    renderer: Arc<dyn PdfRenderer>,
    config: PdfConfig,
}

impl PdfService {
    pub fn new(renderer: Arc<dyn PdfRenderer>, config: PdfConfig) -> Self {
        Self { renderer, config }
    }

    pub async fn generate(
        &self,
        esim: &EsimDetailRow,
        reference_number: &str,
    ) -> Result<PathBuf, FinalizeError> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let template = match tokio::fs::read_to_string(&self.config.template_path).await {
            Ok(content) => content,
            Err(_) => {
                debug!(
                    path = %self.config.template_path.display(),
                    "Template file not found, using built-in template"
                );
                DEFAULT_TEMPLATE.to_string()
            }
        };

        let html = fill_template(&template, esim);
        let file_name = format!("{}_{}.pdf", reference_number, esim.iccid);
        let output = self.config.output_dir.join(file_name);

        self.renderer.render(&html, &output).await?;
        info!(path = %output.display(), "PDF generated");
        Ok(output)
    }
}

/// Substitute `{{FIELD}}` placeholders; absent optional fields render as "-".
fn fill_template(template: &str, esim: &EsimDetailRow) -> String {
    let dash = || "-".to_string();
    template
        .replace("{{PRODUCT_NAME}}", &esim.product_name)
        .replace("{{VALID_FROM}}", &esim.valid_from.clone().unwrap_or_else(dash))
        .replace("{{VALID_UNTIL}}", &esim.valid_until.clone().unwrap_or_else(dash))
        .replace("{{ICCID}}", &esim.iccid)
        .replace("{{QR_CODE}}", &esim.qr_code)
        .replace("{{SMDP_ADDRESS}}", &esim.smdp_address)
        .replace("{{ACTIVATION_CODE}}", &esim.activation_code)
        .replace("{{COMBINED_ACTIVATION}}", &esim.combined_activation)
        .replace("{{APN_NAME}}", &esim.apn_name.clone().unwrap_or_else(dash))
        .replace("{{APN_USERNAME}}", &esim.apn_username.clone().unwrap_or_else(dash))
        .replace("{{APN_PASSWORD}}", &esim.apn_password.clone().unwrap_or_else(dash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::EsimStatus;
    use chrono::Utc;

    fn sample_esim() -> EsimDetailRow {
        EsimDetailRow {
            id: "esim-1".into(),
            order_item_id: "item-1".into(),
            product_name: "eSIM Japan 8 Days".into(),
            valid_from: Some("2026-09-01".into()),
            valid_until: None,
            iccid: "8962000000000001".into(),
            qr_code: "LPA:1$smdp.example$AC-1".into(),
            smdp_address: "smdp.example".into(),
            activation_code: "AC-1".into(),
            combined_activation: "LPA:1$smdp.example$AC-1".into(),
            apn_name: Some("internet".into()),
            apn_username: None,
            apn_password: None,
            status: EsimStatus::Completed,
            pdf_file_path: None,
            pdf_uploaded_at: None,
            provisioned_at: None,
            activated_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn fill_template_substitutes_all_placeholders() {
        let html = fill_template(DEFAULT_TEMPLATE, &sample_esim());
        assert!(html.contains("eSIM Japan 8 Days"));
        assert!(html.contains("8962000000000001"));
        assert!(html.contains("2026-09-01"));
        assert!(!html.contains("{{"));
    }

    #[test]
    fn missing_optionals_render_as_dash() {
        let html = fill_template("{{VALID_UNTIL}}|{{APN_USERNAME}}", &sample_esim());
        assert_eq!(html, "-|-");
    }

    #[tokio::test]
    async fn generates_named_file_with_builtin_template() {
        let dir = tempfile::tempdir().unwrap();
        let config = PdfConfig {
            template_path: dir.path().join("missing.html"),
            output_dir: dir.path().to_path_buf(),
            chromium_bin: None,
        };
        let service = PdfService::new(Arc::new(MockPdfRenderer), config);

        let path = service.generate(&sample_esim(), "ZRPQG8VEGT").await.unwrap();
        assert!(path.ends_with("ZRPQG8VEGT_8962000000000001.pdf"));
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.starts_with("%PDF"));
    }

    #[tokio::test]
    async fn custom_template_file_wins_over_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("custom.html");
        tokio::fs::write(&template_path, "ICCID={{ICCID}}")
            .await
            .unwrap();
        let config = PdfConfig {
            template_path,
            output_dir: dir.path().to_path_buf(),
            chromium_bin: None,
        };
        let service = PdfService::new(Arc::new(MockPdfRenderer), config);

        let path = service.generate(&sample_esim(), "REF1").await.unwrap();
        assert!(path.exists());
    }
}
