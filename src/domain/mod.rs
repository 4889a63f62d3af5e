//! Domain models - core business types
//!
//! - `types` - scan events, entities and dispatch state
//! - `registry` - code to entity mapping
//! - `error` - error taxonomy shared by the pipeline stages

pub mod error;
pub mod registry;
pub mod types;

pub use error::{AuditError, RuleError, SinkError, TransportError};
pub use registry::CodeRegistry;
pub use types::{
    epoch_ms, DispatchRecord, DispatchStatus, Entity, EventRef, Location, ScanEvent, TrackedObject,
};
