//! Asset router - consumes scan events, audits them and routes them to sinks
//!
//! Module structure:
//! - `domain/` - Core types (scan events, registry, dispatch state, errors)
//! - `io/` - External interfaces (MQTT, sinks, audit store, Prometheus)
//! - `services/` - Pipeline stages (scanner, rules, dispatcher, consumer)
//! - `infra/` - Infrastructure (Config, Metrics, logging, Broker)

use anyhow::Context;
use asset_router::infra::logging::init_tracing;
use asset_router::infra::{Config, Metrics};
use asset_router::io::{build_sinks, create_egress_channel, AuditStore, MqttPublisher};
use asset_router::services::{Consumer, Dispatcher, Maintenance, RuleEngine};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Asset router - audited, rule-based delivery of asset scan events
#[derive(Parser, Debug)]
#[command(name = "asset-router", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("info", args.log_json);
    info!("asset-router starting");

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    asset_router::infra::broker::start_embedded_broker(&config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        scan_topic = %config.mqtt_scan_topic(),
        rules = %config.rules().len(),
        sinks = %config.sinks().len(),
        max_in_flight = %config.max_in_flight(),
        audit_database = %config.audit_database(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // invalid rules or sinks are fatal at startup, never at dispatch time
    let rules = Arc::new(RuleEngine::from_config(&config).context("Invalid routing rules")?);
    let sinks = build_sinks(&config).context("Invalid sink configuration")?;
    let audit = AuditStore::open(config.audit_database())
        .await
        .with_context(|| format!("Failed to open audit store {}", config.audit_database()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (force_stop_tx, force_stop_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let mut dispatcher = Dispatcher::from_config(&config, sinks, audit.clone(), metrics.clone(), force_stop_rx);
    // the publisher outlives the consumer drain so alerts raised there still go out
    let (publisher_stop_tx, publisher_stop_rx) = watch::channel(false);
    let mut publisher_task = None;
    if config.mqtt_egress_enabled() {
        let (egress_sender, egress_rx) = create_egress_channel(1000, config.site_id().to_string());
        let publisher = MqttPublisher::new(&config, "router", egress_rx);
        publisher_task = Some(tokio::spawn(publisher.run(publisher_stop_rx)));
        dispatcher = dispatcher.with_egress(egress_sender.with_metrics(metrics.clone()));
    }

    // Inbound transport (bounded: a full queue stops pulling from the broker)
    let (inbound_tx, inbound_rx) = mpsc::channel(config.max_in_flight() * 4);
    let mqtt_config = config.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = asset_router::io::mqtt::start_mqtt_consumer(&mqtt_config, inbound_tx, mqtt_shutdown).await {
            error!(error = %e, "mqtt_consumer_error");
        }
    });

    let maintenance = Maintenance::new(
        audit.clone(),
        config.retention_days(),
        Duration::from_secs(config.maintenance_interval_secs()),
    )
    .with_abandoned_alert(config.alert_abandoned_per_hour());
    tokio::spawn(maintenance.run(shutdown_rx.clone()));

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = asset_router::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    let consumer = Consumer::new(
        audit.clone(),
        rules,
        Arc::new(dispatcher),
        metrics.clone(),
        config.max_in_flight(),
        Duration::from_millis(config.shutdown_grace_ms()),
        force_stop_tx,
    );
    let stats = consumer.run(inbound_rx, shutdown_rx).await;

    // consumer owned the last dispatcher handle, so the egress queue is closed now
    if let Some(mut task) = publisher_task {
        if tokio::time::timeout(Duration::from_secs(10), &mut task).await.is_err() {
            warn!("mqtt_egress_drain_timeout");
            let _ = publisher_stop_tx.send(true);
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
    metrics.report().log();
    info!(recorded = %stats.recorded, duplicates = %stats.duplicates, "asset-router shutdown complete");
    Ok(())
}
