//! Inbound message envelope shared by the consumer and its transports
//!
//! A message carries its own acknowledgement. The consumer acks only after
//! the event and its pending dispatch rows are persisted; an unacked message
//! is redelivered by the transport.

use crate::domain::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Instant;

/// Transport-specific acknowledgement of one inbound message
#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;
}

pub struct InboundMessage {
    pub payload: Bytes,
    pub received_at: Instant,
    ack: Box<dyn Acknowledge>,
}

impl InboundMessage {
    pub fn new(payload: Bytes, ack: Box<dyn Acknowledge>) -> Self {
        Self { payload, received_at: Instant::now(), ack }
    }

    /// Split into payload and acknowledgement handle
    pub fn into_parts(self) -> (Bytes, Instant, Box<dyn Acknowledge>) {
        (self.payload, self.received_at, self.ack)
    }
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage").field("payload_len", &self.payload.len()).finish()
    }
}
