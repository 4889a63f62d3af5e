//! Typed channel for MQTT egress messages
//!
//! Producers never block: if the publisher falls behind, messages are
//! dropped and counted.

use crate::domain::types::{epoch_ms, ScanEvent};
use crate::infra::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Accepted scan event, consumed by the router (QoS 1)
    Scan(ScanPayload),
    /// Processed location update for notify-worthy events (QoS 1)
    LocationUpdate(LocationUpdatePayload),
    /// Abandoned dispatch alert for operators (QoS 1)
    Alert(AlertPayload),
}

#[derive(Debug, Serialize)]
pub struct ScanPayload {
    pub json: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocationUpdatePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Timestamp (epoch ms)
    pub ts: u64,
    pub event_id: String,
    pub scanner_id: String,
    pub sequence_no: u64,
    pub object_id: String,
    pub object_name: String,
    pub location_id: String,
    pub location_name: String,
    /// Where the object was last seen before this event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_location_id: Option<String>,
    pub observed_at: String,
}

impl LocationUpdatePayload {
    pub fn from_event(event: &ScanEvent, previous_location_id: Option<String>) -> Self {
        Self {
            site: None,
            ts: epoch_ms(),
            event_id: event.event_id.to_string(),
            scanner_id: event.scanner_id.clone(),
            sequence_no: event.sequence_no,
            object_id: event.object_id.clone(),
            object_name: event.object_name.clone(),
            location_id: event.location_id.clone(),
            location_name: event.location_name.clone(),
            previous_location_id,
            observed_at: event.observed_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub ts: u64,
    /// Alert type
    pub t: String,
    pub scanner_id: String,
    pub sequence_no: u64,
    pub object_id: String,
    pub location_id: String,
    pub sink: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AlertPayload {
    pub fn abandoned(event: &ScanEvent, sink: &str, attempts: u32, error: Option<&str>) -> Self {
        Self {
            site: None,
            ts: epoch_ms(),
            t: "dispatch_abandoned".to_string(),
            scanner_id: event.scanner_id.clone(),
            sequence_no: event.sequence_no,
            object_id: event.object_id.clone(),
            location_id: event.location_id.clone(),
            sink: sink.to_string(),
            attempts,
            error: error.map(str::to_string),
        }
    }
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
    metrics: Option<Arc<Metrics>>,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String) -> Self {
        Self { tx, site_id, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Hand an accepted scan event to the transport
    ///
    /// Returns false if the event was dropped because the queue is full.
    pub fn send_scan(&self, event: &ScanEvent) -> bool {
        let payload = ScanPayload { json: event.to_json() };
        match self.tx.try_send(EgressMessage::Scan(payload)) {
            Ok(()) => true,
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.record_publish_dropped();
                }
                warn!(event = %event.event_ref(), error = %e, "scan_publish_dropped");
                false
            }
        }
    }

    pub fn send_location_update(&self, mut payload: LocationUpdatePayload) {
        payload.site = Some(self.site_id.clone());
        let _ = self.tx.try_send(EgressMessage::LocationUpdate(payload));
    }

    pub fn send_alert(&self, mut payload: AlertPayload) {
        payload.site = Some(self.site_id.clone());
        let _ = self.tx.try_send(EgressMessage::Alert(payload));
    }
}

/// Create a new egress channel pair
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn event() -> ScanEvent {
        ScanEvent {
            event_id: Uuid::now_v7(),
            scanner_id: "pi-dock".to_string(),
            sequence_no: 7,
            object_id: "OBJ002".to_string(),
            object_name: "Laptop".to_string(),
            category: "personal".to_string(),
            location_id: "LOC002".to_string(),
            location_name: "Server Room".to_string(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_scan_payload_round_trips_event() {
        let (sender, mut rx) = create_egress_channel(4, "depot".to_string());
        let event = event();
        assert!(sender.send_scan(&event));

        let Ok(EgressMessage::Scan(payload)) = rx.try_recv() else {
            panic!("expected scan message");
        };
        let decoded: ScanEvent = serde_json::from_str(&payload.json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let (tx, _rx) = mpsc::channel(1);
        let metrics = Arc::new(Metrics::new());
        let sender = EgressSender::new(tx, "depot".to_string()).with_metrics(metrics.clone());
        assert!(sender.send_scan(&event()));
        assert!(!sender.send_scan(&event()));
        assert_eq!(metrics.report().publish_dropped_total, 1);
    }

    #[test]
    fn test_site_is_injected() {
        let (sender, mut rx) = create_egress_channel(4, "depot".to_string());
        sender.send_alert(AlertPayload::abandoned(&event(), "crm", 3, Some("HTTP 503")));

        let Ok(EgressMessage::Alert(alert)) = rx.try_recv() else {
            panic!("expected alert");
        };
        assert_eq!(alert.site.as_deref(), Some("depot"));
        assert_eq!(alert.t, "dispatch_abandoned");
        assert_eq!(alert.attempts, 3);
    }

    #[test]
    fn test_location_update_carries_previous_location() {
        let payload = LocationUpdatePayload::from_event(&event(), Some("LOC001".to_string()));
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"previous_location_id\":\"LOC001\""));
        assert!(!json.contains("\"site\""));
    }
}
