//! Asset scanner - turns decoded QR codes into scan events
//!
//! Reads one decoded code per line from stdin (a camera decoder pipes into
//! this), tracks the current location, debounces repeats and publishes
//! accepted events to the broker.
//!
//! Usage:
//!   zbarcam --raw | asset-scanner --config config/dev.toml
//!   printf 'LOC001\nOBJ001\n' | asset-scanner --scanner-id pi-bench

use anyhow::Context;
use asset_router::infra::logging::init_tracing;
use asset_router::infra::{Config, Metrics};
use asset_router::io::{create_egress_channel, MqttPublisher};
use asset_router::services::scanner::RawScan;
use asset_router::services::ScannerSession;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "asset-scanner", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Override `[scanner] id` from the config file
    #[arg(long)]
    scanner_id: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("info", args.log_json);

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);
    let scanner_id = args.scanner_id.unwrap_or_else(|| config.scanner_id().to_string());
    anyhow::ensure!(!scanner_id.trim().is_empty(), "scanner id must not be empty");

    let registry = Arc::new(config.registry());
    info!(
        config_file = %config.config_file(),
        scanner_id = %scanner_id,
        objects = %registry.object_count(),
        locations = %registry.location_count(),
        window_ms = %config.debounce_window_ms(),
        topic = %config.mqtt_scan_topic(),
        "asset-scanner starting"
    );
    for code in registry.ambiguous_codes() {
        warn!(code = %code, "code_is_location_and_object");
    }

    let metrics = Arc::new(Metrics::new());
    let session = ScannerSession::new(
        scanner_id.clone(),
        registry,
        config.debounce_window_ms(),
        config.debounce_capacity(),
    )
    .with_metrics(metrics.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (egress_sender, egress_rx) = create_egress_channel(1000, config.site_id().to_string());
    let publisher = MqttPublisher::new(&config, &format!("scanner-{scanner_id}"), egress_rx);
    // stopped only after the session's last publish is queued
    let (publisher_stop_tx, publisher_stop_rx) = watch::channel(false);
    let mut publisher_task = tokio::spawn(publisher.run(publisher_stop_rx));

    let (scan_tx, scan_rx) = mpsc::channel::<RawScan>(256);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let code = line.trim();
                    if code.is_empty() {
                        continue;
                    }
                    if scan_tx.send(RawScan::now(code)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!("scanner_input_closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "scanner_input_error");
                    break;
                }
            }
        }
    });

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = signal_tx.send(true);
    });

    let stats = session
        .run(
            scan_rx,
            egress_sender.with_metrics(metrics.clone()),
            Duration::from_secs(config.scanner_status_interval_secs()),
            shutdown_rx,
        )
        .await;

    // session dropped its sender, so the publisher drains and disconnects
    let drained = tokio::time::timeout(Duration::from_secs(10), &mut publisher_task).await;
    if drained.is_err() {
        let _ = publisher_stop_tx.send(true);
    }
    drained.context("publisher did not drain in time")?.context("publisher task failed")?;
    drop(shutdown_tx);

    info!(
        scanner_id = %scanner_id,
        events = %stats.events,
        debounced = %stats.debounced,
        dropped = %metrics.publish_dropped_total(),
        "asset-scanner shutdown complete"
    );
    Ok(())
}
