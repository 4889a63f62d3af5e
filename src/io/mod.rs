//! IO modules - external system interfaces
//!
//! - `mqtt` - MQTT subscription for inbound scan events (manual acks)
//! - `transport` - inbound message envelope with its acknowledgement
//! - `mqtt_egress` - MQTT publisher for scans, location updates and alerts
//! - `egress_channel` - typed channel feeding the publisher
//! - `sinks` - downstream delivery adapters (http, jsonl, log)
//! - `audit` - SQLite audit store
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod audit;
pub mod egress_channel;
pub mod mqtt;
pub mod mqtt_egress;
pub mod prometheus;
pub mod sinks;
pub mod transport;

pub use audit::{AuditQuery, AuditStore, RecordOutcome};
pub use egress_channel::{create_egress_channel, EgressSender};
pub use mqtt_egress::MqttPublisher;
pub use sinks::{build_sinks, Sink, SinkMap};
pub use transport::{Acknowledge, InboundMessage};
