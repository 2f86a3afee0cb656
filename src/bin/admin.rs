//! Admin CLI — the human side of the pipeline.
//!
//! Subcommands:
//!   status                                   in-flight eSIM records
//!   list-otps                                pending upload OTPs
//!   confirm-otp <code> [name]                confirm an upload OTP
//!   retry                                    re-run the retry passes
//!   regenerate-pdf <confirmation-code>       rebuild one PDF
//!   regenerate-pdf --all-done                rebuild PDFs for DONE records

use std::sync::Arc;

use esim_relay::config::{
    DatabaseConfig, FulfillmentConfig, OtpConfig, PdfConfig, UploadConfig,
};
use esim_relay::finalize::{FinalizePipeline, PdfService, create_renderer, create_upload_client};
use esim_relay::fulfillment::{SyncService, create_client};
use esim_relay::otp::OtpService;
use esim_relay::pipeline::RetryDriver;
use esim_relay::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        std::process::exit(2);
    };

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&DatabaseConfig::from_env().path).await?,
    );

    match command.as_str() {
        "status" => {
            let in_flight = db.find_completed_but_not_done().await?;
            if in_flight.is_empty() {
                println!("No in-flight eSIM records.");
                return Ok(());
            }
            println!("{} in-flight record(s):", in_flight.len());
            for esim in in_flight {
                println!(
                    "  {}  {}  {}  updated={}",
                    esim.iccid,
                    esim.status.as_str(),
                    esim.product_name,
                    esim.updated_at.format("%Y-%m-%d %H:%M UTC")
                );
            }
        }
        "list-otps" => {
            let otp = OtpService::new(Arc::clone(&db), OtpConfig::from_env()?);
            let pending = otp.get_pending().await?;
            if pending.is_empty() {
                println!("No pending OTPs.");
                return Ok(());
            }
            println!("{} pending OTP(s):", pending.len());
            for otp in pending {
                println!(
                    "  {}  code={}  expires={}  pdf={}",
                    otp.confirmation_code,
                    otp.otp_code,
                    otp.expires_at.format("%Y-%m-%d %H:%M UTC"),
                    otp.pdf_file_path
                );
            }
        }
        "confirm-otp" => {
            let Some(code) = args.get(1) else {
                eprintln!("Usage: admin confirm-otp <code> [name]");
                std::process::exit(2);
            };
            let confirmed_by = args.get(2).map(String::as_str).unwrap_or("admin");

            let pipeline = build_finalize_pipeline(Arc::clone(&db))?;
            pipeline.confirm_upload(code, confirmed_by).await?;
            println!("OTP {code} confirmed by {confirmed_by}.");
        }
        "retry" => {
            let driver = RetryDriver::new(
                Arc::clone(&db),
                SyncService::new(Arc::clone(&db), create_client(&FulfillmentConfig::from_env()?)),
            );
            let report = driver.retry_failed_syncs(100).await?;
            println!(
                "Deliveries: {} attempted, {} recovered.",
                report.attempted, report.recovered
            );
            let requeued = driver.requeue_failed_esims(100).await?;
            println!("Finalize: {requeued} record(s) re-queued.");
        }
        "regenerate-pdf" => {
            let Some(target) = args.get(1) else {
                eprintln!("Usage: admin regenerate-pdf <confirmation-code>|--all-done");
                std::process::exit(2);
            };
            let config = PdfConfig::from_env();
            let pdf = PdfService::new(create_renderer(&config), config);

            if target == "--all-done" {
                let done = db.find_done().await?;
                for esim in &done {
                    let Some(item) = db.find_item_by_id(&esim.order_item_id).await? else {
                        eprintln!("Skipping {}: order item missing", esim.iccid);
                        continue;
                    };
                    let path = pdf.generate(esim, &item.reference_number).await?;
                    println!("{} -> {}", item.confirmation_code, path.display());
                }
                println!("Regenerated {} PDF(s).", done.len());
            } else {
                let Some(item) = db.find_item_by_confirmation_code(target).await? else {
                    eprintln!("No order item with confirmation code {target}");
                    std::process::exit(1);
                };
                let Some(esim) = db.find_esim_by_order_item(&item.order_item_id).await? else {
                    eprintln!("No eSIM record for {target} (not provisioned yet)");
                    std::process::exit(1);
                };
                let path = pdf.generate(&esim, &item.reference_number).await?;
                println!("{} -> {}", target, path.display());
            }
        }
        other => {
            eprintln!("Unknown command: {other}\n");
            print_usage();
            std::process::exit(2);
        }
    }

    Ok(())
}

fn build_finalize_pipeline(db: Arc<dyn Database>) -> anyhow::Result<FinalizePipeline> {
    let pdf_config = PdfConfig::from_env();
    Ok(FinalizePipeline::new(
        Arc::clone(&db),
        PdfService::new(create_renderer(&pdf_config), pdf_config),
        create_upload_client(&UploadConfig::from_env()?),
        OtpService::new(db, OtpConfig::from_env()?),
    ))
}

fn print_usage() {
    eprintln!("esim-relay admin");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  status                               list in-flight eSIM records");
    eprintln!("  list-otps                            list pending upload OTPs");
    eprintln!("  confirm-otp <code> [name]            confirm an upload OTP");
    eprintln!("  retry                                retry failed deliveries and finalizes");
    eprintln!("  regenerate-pdf <code>|--all-done     rebuild eSIM PDFs");
}
