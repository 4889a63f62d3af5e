//! Log-only sink, for dry runs and the default catch-all rule

use super::Sink;
use crate::domain::error::SinkError;
use crate::domain::types::ScanEvent;
use async_trait::async_trait;
use tracing::info;

pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &ScanEvent) -> Result<(), SinkError> {
        info!(
            sink = %self.name,
            event = %event.event_ref(),
            object_id = %event.object_id,
            object = %event.object_name,
            location_id = %event.location_id,
            location = %event.location_name,
            observed_at = %event.observed_at.to_rfc3339(),
            "asset_moved"
        );
        Ok(())
    }
}
