//! Error types for the pipeline stages
//!
//! Non-fatal scan conditions (unknown code, location not established) are not
//! errors; they are variants of `services::scanner::Resolution`.

use thiserror::Error;

/// Outcome of a failed `Sink::send`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Transient failure, worth retrying with backoff
    #[error("retriable: {0}")]
    Retriable(String),
    /// The sink rejected the event; retrying cannot help
    #[error("permanent: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, SinkError::Retriable(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            SinkError::Retriable(r) | SinkError::Permanent(r) => r,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database path error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt audit row: {0}")]
    Corrupt(String),
}

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("rule '{rule}' targets unknown sink '{sink}'")]
    UnknownSink { rule: String, sink: String },

    #[error("rule '{rule}' has invalid time '{value}' (expected HH:MM or HH:MM:SS)")]
    InvalidTime { rule: String, value: String },

    #[error("rule '{rule}' has no target sinks")]
    NoTargets { rule: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Broker unreachable; the consumer suspends and reconnects with backoff
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("acknowledge failed: {0}")]
    Ack(String),

    #[error("transport closed")]
    Closed,
}
