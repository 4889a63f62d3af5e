//! MQTT subscription for inbound scan events
//!
//! Subscribes at QoS 1 with manual acknowledgement and a persistent session,
//! so a publish the router has not acked is redelivered by the broker after a
//! reconnect. Messages are handed to the consumer with `send().await`: a full
//! consumer queue stops pulling instead of dropping.

use crate::domain::error::TransportError;
use crate::infra::config::Config;
use crate::io::transport::{Acknowledge, InboundMessage};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, Publish, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Acks one publish back to the broker through the shared client
struct MqttAck {
    client: AsyncClient,
    publish: Publish,
}

#[async_trait]
impl Acknowledge for MqttAck {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.client.ack(&self.publish).await.map_err(|e| TransportError::Ack(e.to_string()))
    }
}

/// Connection options shared by the inbound subscriber and the egress publisher
pub fn mqtt_options(config: &Config, role: &str) -> MqttOptions {
    let client_id = format!("{}-{}", config.site_id(), role);
    let mut options = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        options.set_credentials(username, password);
    }
    options
}

/// Delay before reconnect attempt `failures` (1-based)
fn reconnect_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    RECONNECT_BASE.saturating_mul(1u32 << exp).min(RECONNECT_MAX)
}

/// Subscribe to the scan topic and forward publishes until shutdown
///
/// Connection errors never end the loop; the event loop reconnects with
/// exponential backoff. Returns when shutdown is signalled or the consumer
/// side of `tx` is gone.
pub async fn start_mqtt_consumer(
    config: &Config,
    tx: mpsc::Sender<InboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let mut options = mqtt_options(config, "router");
    options.set_manual_acks(true);
    options.set_clean_session(false);

    let topic = config.mqtt_scan_topic().to_string();
    let (client, mut eventloop) = AsyncClient::new(options, 1000);
    client
        .subscribe(topic.as_str(), QoS::AtLeastOnce)
        .await
        .map_err(|e| TransportError::Unavailable(e.to_string()))?;
    info!(topic = %topic, host = %config.mqtt_host(), port = %config.mqtt_port(), "mqtt_consumer_subscribed");

    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("mqtt_consumer_shutdown");
                    let _ = client.disconnect().await;
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        debug!(topic = %publish.topic, pkid = %publish.pkid, bytes = %publish.payload.len(), "mqtt_publish_received");
                        let message = InboundMessage::new(
                            publish.payload.clone(),
                            Box::new(MqttAck { client: client.clone(), publish }),
                        );
                        tokio::select! {
                            sent = tx.send(message) => {
                                if sent.is_err() {
                                    warn!("mqtt_consumer_channel_closed");
                                    return Err(TransportError::Closed);
                                }
                            }
                            _ = shutdown.changed() => {
                                info!("mqtt_consumer_shutdown");
                                let _ = client.disconnect().await;
                                return Ok(());
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code != ConnectReturnCode::Success {
                            warn!(code = ?ack.code, "mqtt_connect_refused");
                            continue;
                        }
                        failures = 0;
                        info!(session_present = %ack.session_present, "mqtt_connected");
                        if !ack.session_present {
                            // fresh session: the broker forgot our subscription
                            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                error!(error = %e, "mqtt_resubscribe_failed");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = reconnect_delay(failures);
                        error!(error = %e, failures = %failures, retry_in_ms = %delay.as_millis(), "mqtt_unavailable");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => {
                                info!("mqtt_consumer_shutdown");
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}
