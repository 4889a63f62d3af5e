//! Scanner session: turns raw decoded codes into location-qualified scan events
//!
//! One session exists per physical scanner and is owned by that scanner's
//! task. It holds the current location, the debounce filter and the sequence
//! counter; nothing in it is shared.

mod debounce;

pub use debounce::DebounceFilter;

use crate::domain::registry::CodeRegistry;
use crate::domain::types::{epoch_ms, Entity, Location, ScanEvent, TrackedObject};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::egress_channel::EgressSender;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A decoded code as handed over by the frame decoder
#[derive(Debug, Clone)]
pub struct RawScan {
    pub code: String,
    pub observed_at: DateTime<Utc>,
}

impl RawScan {
    pub fn now(code: impl Into<String>) -> Self {
        Self { code: code.into(), observed_at: Utc::now() }
    }
}

/// Outcome of resolving one decoded code
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Object scanned at an established location, past the debounce window
    Event(ScanEvent),
    /// Location scan; never produces an event
    LocationSet { location_id: String, previous: Option<String> },
    /// Same object and location seen again inside the window
    Debounced { object_id: String, location_id: String },
    UnknownCode(String),
    /// Object scanned before this session saw any location
    LocationNotEstablished { object_id: String },
}

impl Resolution {
    pub fn into_event(self) -> Option<ScanEvent> {
        match self {
            Resolution::Event(event) => Some(event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct LocationState {
    location: Location,
    set_at: DateTime<Utc>,
}

/// Running counters for the periodic status line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub codes_seen: u64,
    pub events: u64,
    pub debounced: u64,
    pub unknown: u64,
    pub location_missing: u64,
    pub location_changes: u64,
}

pub struct ScannerSession {
    scanner_id: String,
    registry: Arc<CodeRegistry>,
    location: Option<LocationState>,
    debounce: DebounceFilter,
    next_sequence: u64,
    stats: SessionStats,
    metrics: Option<Arc<Metrics>>,
}

impl ScannerSession {
    /// Create a session; the sequence counter starts at the current epoch ms
    /// so a restarted scanner never reuses an earlier sequence number
    pub fn new(
        scanner_id: impl Into<String>,
        registry: Arc<CodeRegistry>,
        debounce_window_ms: u64,
        debounce_capacity: usize,
    ) -> Self {
        Self {
            scanner_id: scanner_id.into(),
            registry,
            location: None,
            debounce: DebounceFilter::new(debounce_window_ms, debounce_capacity),
            next_sequence: epoch_ms(),
            stats: SessionStats::default(),
            metrics: None,
        }
    }

    pub fn from_config(config: &Config, registry: Arc<CodeRegistry>) -> Self {
        Self::new(
            config.scanner_id(),
            registry,
            config.debounce_window_ms(),
            config.debounce_capacity(),
        )
    }

    pub fn with_sequence_start(mut self, start: u64) -> Self {
        self.next_sequence = start;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn scanner_id(&self) -> &str {
        &self.scanner_id
    }

    pub fn current_location(&self) -> Option<&Location> {
        self.location.as_ref().map(|state| &state.location)
    }

    pub fn location_set_at(&self) -> Option<DateTime<Utc>> {
        self.location.as_ref().map(|state| state.set_at)
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Resolve one decoded code observed at `now`
    pub fn resolve(&mut self, code: &str, now: DateTime<Utc>) -> Resolution {
        self.stats.codes_seen += 1;
        if let Some(m) = &self.metrics {
            m.record_scan();
        }

        let registry = Arc::clone(&self.registry);
        match registry.lookup(code) {
            Some(Entity::Location(location)) => self.set_location(location, now),
            Some(Entity::Object(object)) => self.scan_object(object, now),
            None => {
                self.stats.unknown += 1;
                if let Some(m) = &self.metrics {
                    m.record_unknown_code();
                }
                warn!(scanner_id = %self.scanner_id, code = %code.trim(), "unknown_code");
                Resolution::UnknownCode(code.to_string())
            }
        }
    }

    fn set_location(&mut self, location: &Location, now: DateTime<Utc>) -> Resolution {
        let previous = self.location.replace(LocationState { location: location.clone(), set_at: now });
        let previous = previous.map(|state| state.location.id);

        if previous.as_deref() != Some(location.id.as_str()) {
            self.stats.location_changes += 1;
            info!(
                scanner_id = %self.scanner_id,
                location_id = %location.id,
                location = %location.display_name,
                "location_set"
            );
        }

        Resolution::LocationSet { location_id: location.id.clone(), previous }
    }

    fn scan_object(&mut self, object: &TrackedObject, now: DateTime<Utc>) -> Resolution {
        let Some(location) = self.location.as_ref().map(|state| state.location.clone()) else {
            self.stats.location_missing += 1;
            if let Some(m) = &self.metrics {
                m.record_location_missing();
            }
            warn!(scanner_id = %self.scanner_id, object_id = %object.id, "location_not_established");
            return Resolution::LocationNotEstablished { object_id: object.id.clone() };
        };

        if !self.debounce.admit(&object.id, &location.id, now) {
            self.stats.debounced += 1;
            if let Some(m) = &self.metrics {
                m.record_debounced();
            }
            debug!(object_id = %object.id, location_id = %location.id, "scan_debounced");
            return Resolution::Debounced { object_id: object.id.clone(), location_id: location.id };
        }

        let sequence_no = self.next_sequence;
        self.next_sequence += 1;
        self.stats.events += 1;
        if let Some(m) = &self.metrics {
            m.record_event_emitted();
        }

        let event = ScanEvent {
            event_id: Uuid::now_v7(),
            scanner_id: self.scanner_id.clone(),
            sequence_no,
            object_id: object.id.clone(),
            object_name: object.display_name.clone(),
            category: object.category.clone(),
            location_id: location.id,
            location_name: location.display_name,
            observed_at: now,
        };
        info!(
            scanner_id = %event.scanner_id,
            seq = %event.sequence_no,
            object_id = %event.object_id,
            location_id = %event.location_id,
            "scan_event_emitted"
        );
        Resolution::Event(event)
    }

    /// Consume raw scans until the channel closes or shutdown is signalled,
    /// handing accepted events to the publisher
    pub async fn run(
        mut self,
        mut scans: mpsc::Receiver<RawScan>,
        publisher: EgressSender,
        status_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> SessionStats {
        let mut status = interval(status_interval);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);
        status.tick().await;

        loop {
            tokio::select! {
                scan = scans.recv() => {
                    let Some(scan) = scan else { break };
                    if let Some(event) = self.resolve(&scan.code, scan.observed_at).into_event() {
                        publisher.send_scan(&event);
                    }
                }
                _ = status.tick() => {
                    self.log_status();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.log_status();
        self.stats
    }

    fn log_status(&self) {
        info!(
            scanner_id = %self.scanner_id,
            location_id = %self.current_location().map(|l| l.id.as_str()).unwrap_or("-"),
            codes = %self.stats.codes_seen,
            events = %self.stats.events,
            debounced = %self.stats.debounced,
            unknown = %self.stats.unknown,
            no_location = %self.stats.location_missing,
            "scanner_status"
        );
    }
}
