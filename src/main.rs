use std::sync::Arc;
use std::time::Duration;

use esim_relay::config::AppConfig;
use esim_relay::finalize::{FinalizePipeline, PdfService, create_renderer, create_upload_client};
use esim_relay::fulfillment::{SyncService, create_client};
use esim_relay::mailbox::{ImapMailbox, spawn_poll_loop};
use esim_relay::otp::OtpService;
use esim_relay::pipeline::{IngestPipeline, RetryDriver};
use esim_relay::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    // The guard flushes buffered file output on drop; hold it for the
    // life of the process.
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "esim-relay.log"));
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    eprintln!("📨 esim-relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database.path.display());
    eprintln!(
        "   Mailbox: {}:{} (poll every {}s)",
        config.mailbox.imap_host, config.mailbox.imap_port, config.mailbox.poll_interval_secs
    );
    eprintln!("   Fulfillment: {:?}", config.fulfillment.backend);
    eprintln!("   Finalize: every {}s\n", config.finalize_interval_secs);

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.database.path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {e}",
                    config.database.path.display()
                );
                std::process::exit(1);
            }),
    );

    // ── Components ──────────────────────────────────────────────────
    let fulfillment_client = create_client(&config.fulfillment);
    let mailbox = Arc::new(ImapMailbox::new(config.mailbox.clone()));
    let ingest = IngestPipeline::new(
        Arc::clone(&db),
        mailbox.clone(),
        SyncService::new(Arc::clone(&db), fulfillment_client.clone()),
    );

    let otp_service = OtpService::new(Arc::clone(&db), config.otp.clone());
    let finalize = FinalizePipeline::new(
        Arc::clone(&db),
        PdfService::new(create_renderer(&config.pdf), config.pdf.clone()),
        create_upload_client(&config.upload),
        otp_service,
    );
    let retry = RetryDriver::new(
        Arc::clone(&db),
        SyncService::new(Arc::clone(&db), fulfillment_client),
    );

    // ── Periodic finalize + maintenance pass ────────────────────────
    let sweep_db = Arc::clone(&db);
    let sweep_otp_config = config.otp.clone();
    let finalize_interval = config.finalize_interval_secs;
    tokio::spawn(async move {
        let otp_sweep = OtpService::new(sweep_db, sweep_otp_config);
        let mut tick = tokio::time::interval(Duration::from_secs(finalize_interval));
        loop {
            tick.tick().await;
            if let Err(e) = otp_sweep.expire_old().await {
                tracing::error!(error = %e, "OTP sweep failed");
            }
            if let Err(e) = retry.retry_failed_syncs(50).await {
                tracing::error!(error = %e, "Delivery retry pass failed");
            }
            if let Err(e) = retry.requeue_failed_esims(50).await {
                tracing::error!(error = %e, "Finalize re-queue failed");
            }
            match finalize.run(50).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(advanced = n, "Finalize pass done"),
                Err(e) => tracing::error!(error = %e, "Finalize pass failed"),
            }
        }
    });

    // ── Mailbox poll loop + sequential dispatch ─────────────────────
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _poll_handle = spawn_poll_loop(
        mailbox,
        config.mailbox.poll_interval_secs,
        config.mailbox.allowed_senders.clone(),
        tx,
    );

    loop {
        tokio::select! {
            Some(msg) = rx.recv() => {
                let uid = msg.uid;
                match ingest.handle_message(&msg).await {
                    Ok(outcome) => {
                        tracing::info!(uid, ?outcome, "Message handled");
                    }
                    Err(e) => {
                        tracing::error!(uid, error = %e, "Message processing failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
