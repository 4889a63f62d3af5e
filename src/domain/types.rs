//! Shared types for the asset router

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current time as epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// A fixed place an object can be scanned at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub display_name: String,
}

/// A trackable item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub id: String,
    pub display_name: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// What a decoded code resolves to in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity<'a> {
    Location(&'a Location),
    Object(&'a TrackedObject),
}

/// A location-qualified movement of one object, as seen by one scanner
///
/// `(scanner_id, sequence_no)` is the identity used for idempotent storage.
/// `event_id` is a globally unique id handed to sinks for their own dedup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub event_id: Uuid,
    pub scanner_id: String,
    pub sequence_no: u64,
    pub object_id: String,
    pub object_name: String,
    pub category: String,
    pub location_id: String,
    pub location_name: String,
    pub observed_at: DateTime<Utc>,
}

impl ScanEvent {
    /// Stable reference used in logs and dispatch records
    pub fn event_ref(&self) -> EventRef {
        EventRef { scanner_id: self.scanner_id.clone(), sequence_no: self.sequence_no }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Primary key of an audited scan event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventRef {
    pub scanner_id: String,
    pub sequence_no: u64,
}

impl std::fmt::Display for EventRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.scanner_id, self.sequence_no)
    }
}

/// Lifecycle of one (event, sink) delivery
///
/// Allowed moves:
/// `pending -> delivered | failed | abandoned`,
/// `pending -> retrying` (first attempt interrupted by a force stop),
/// `failed -> retrying | abandoned`,
/// `retrying -> retrying | delivered | abandoned`.
/// `delivered` and `abandoned` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Pending,
    Failed,
    Retrying,
    Delivered,
    Abandoned,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Pending => "pending",
            DispatchStatus::Failed => "failed",
            DispatchStatus::Retrying => "retrying",
            DispatchStatus::Delivered => "delivered",
            DispatchStatus::Abandoned => "abandoned",
        }
    }

    /// Ordering used to keep persisted status monotonic
    pub fn rank(&self) -> i64 {
        match self {
            DispatchStatus::Pending => 0,
            DispatchStatus::Failed => 1,
            DispatchStatus::Retrying => 2,
            DispatchStatus::Delivered | DispatchStatus::Abandoned => 3,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchStatus::Delivered | DispatchStatus::Abandoned)
    }

    pub fn can_advance_to(&self, next: DispatchStatus) -> bool {
        use DispatchStatus::*;
        matches!(
            (self, next),
            (Pending, Delivered | Failed | Retrying | Abandoned)
                | (Failed, Retrying | Abandoned)
                | (Retrying, Retrying | Delivered | Abandoned)
        )
    }
}

impl std::str::FromStr for DispatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => DispatchStatus::Pending,
            "failed" => DispatchStatus::Failed,
            "retrying" => DispatchStatus::Retrying,
            "delivered" => DispatchStatus::Delivered,
            "abandoned" => DispatchStatus::Abandoned,
            other => return Err(format!("unknown dispatch status '{other}'")),
        })
    }
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one (event, sink) delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchRecord {
    pub event_ref: EventRef,
    pub sink_name: String,
    pub notify: bool,
    pub attempt_count: u32,
    pub last_status: DispatchStatus,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchRecord {
    pub fn pending(event_ref: EventRef, sink_name: &str, notify: bool) -> Self {
        Self {
            event_ref,
            sink_name: sink_name.to_string(),
            notify,
            attempt_count: 0,
            last_status: DispatchStatus::Pending,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}
