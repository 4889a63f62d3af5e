//! Embedded MQTT broker for single-host deployments
//!
//! Scanners publish to it and the router consumes from it, so a Pi with no
//! external broker can run the whole pipeline.

use crate::infra::config::Config as AppConfig;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

fn broker_config(listen: SocketAddr) -> Config {
    let router = RouterConfig {
        max_segment_size: 16 * 1024 * 1024,
        max_segment_count: 10,
        max_connections: 256,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let connections = ConnectionSettings {
        connection_timeout_ms: 5000,
        max_payload_size: 64 * 1024,
        max_inflight_count: 100,
        auth: None,
        dynamic_filters: false,
        external_auth: None,
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections,
        },
    );

    Config {
        id: 0,
        router,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start the embedded broker if `[broker] enabled = true`
///
/// Returns whether a broker thread was started.
pub fn start_embedded_broker(app_config: &AppConfig) -> bool {
    if !app_config.broker_enabled() {
        return false;
    }

    let addr = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    let listen: SocketAddr = match addr.parse() {
        Ok(listen) => listen,
        Err(e) => {
            warn!(error = %e, addr = %addr, "broker_invalid_bind_address");
            return false;
        }
    };

    let config = broker_config(listen);
    thread::spawn(move || {
        // start() blocks for the lifetime of the broker
        if let Err(e) = Broker::new(config).start() {
            warn!(error = %e, "broker_start_failed");
        }
    });

    thread::sleep(Duration::from_millis(100));
    info!(addr = %listen, "broker_started");
    true
}
