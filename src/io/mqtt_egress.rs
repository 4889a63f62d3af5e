//! MQTT publisher for egress messages
//!
//! - `<mqtt.scan_topic>` - accepted scan events from scanners (QoS 1)
//! - `<mqtt_egress.updates_topic>` - processed location updates (QoS 1)
//! - `<mqtt_egress.alerts_topic>` - abandoned dispatch alerts (QoS 1)

use crate::infra::config::Config;
use crate::io::egress_channel::EgressMessage;
use crate::io::mqtt::mqtt_options;
use rumqttc::{AsyncClient, Event, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// MQTT publisher actor
pub struct MqttPublisher {
    client: AsyncClient,
    eventloop_task: JoinHandle<()>,
    rx: mpsc::Receiver<EgressMessage>,
    scans_topic: String,
    updates_topic: String,
    alerts_topic: String,
}

impl MqttPublisher {
    /// Create a publisher; `role` keeps client ids of scanners and router distinct
    pub fn new(config: &Config, role: &str, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let mut options = mqtt_options(config, &format!("{role}-pub"));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, 100);

        let eventloop_task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => info!("mqtt_egress_connected"),
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
                    Ok(Event::Incoming(Packet::PubAck(ack))) => debug!(pkid = ack.pkid, "mqtt_egress_puback"),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            eventloop_task,
            rx,
            scans_topic: config.mqtt_scan_topic().to_string(),
            updates_topic: config.mqtt_egress_updates_topic().to_string(),
            alerts_topic: config.mqtt_egress_alerts_topic().to_string(),
        }
    }

    /// Publish until shutdown or until every sender is gone, then drain
    /// what is already queued and disconnect
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            scans = %self.scans_topic,
            updates = %self.updates_topic,
            alerts = %self.alerts_topic,
            "mqtt_egress_started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        break;
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => self.publish_message(msg).await,
                        None => break,
                    }
                }
            }
        }

        // queued publishes go out ahead of the disconnect
        if self.client.disconnect().await.is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(5), self.eventloop_task).await;
        }
    }

    async fn publish_message(&self, msg: EgressMessage) {
        let (topic, body, kind) = match msg {
            EgressMessage::Scan(payload) => (&self.scans_topic, payload.json, "scan"),
            EgressMessage::LocationUpdate(payload) => match serde_json::to_string(&payload) {
                Ok(json) => (&self.updates_topic, json, "location_update"),
                Err(e) => {
                    error!(error = %e, "mqtt_egress_serialize_failed");
                    return;
                }
            },
            EgressMessage::Alert(payload) => match serde_json::to_string(&payload) {
                Ok(json) => (&self.alerts_topic, json, "alert"),
                Err(e) => {
                    error!(error = %e, "mqtt_egress_serialize_failed");
                    return;
                }
            },
        };

        if let Err(e) = self.client.publish(topic, QoS::AtLeastOnce, false, body.into_bytes()).await {
            error!(error = %e, kind = kind, topic = %topic, "mqtt_egress_publish_failed");
        }
    }
}
