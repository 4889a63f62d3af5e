//! Sink adapters - external systems that receive dispatched events
//!
//! - `http` - JSON POST (search index, CRM, directory bridges)
//! - `jsonl` - append-only local file
//! - `log` - structured log line

pub mod http;
pub mod jsonl;
pub mod log;

use crate::domain::error::SinkError;
use crate::domain::types::ScanEvent;
use crate::infra::config::{Config, SinkConfig, SinkKind};
use anyhow::Context;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;

pub use self::http::HttpSink;
pub use self::jsonl::JsonlSink;
pub use self::log::LogSink;

/// Capability every downstream system is reduced to
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one event; implementations must tolerate redelivery
    async fn send(&self, event: &ScanEvent) -> Result<(), SinkError>;
}

pub type SinkMap = FxHashMap<String, Arc<dyn Sink>>;

/// Instantiate one sink from its config entry
pub fn build_sink(config: &Config, sink: &SinkConfig) -> anyhow::Result<Arc<dyn Sink>> {
    Ok(match &sink.kind {
        SinkKind::Http { url, username, password, bearer_token } => {
            let timeout = Duration::from_millis(config.sink_timeout_ms_for(sink));
            let auth = match (username, password, bearer_token) {
                (_, _, Some(token)) => http::Auth::Bearer(token.clone()),
                (Some(user), password, None) => http::Auth::Basic(user.clone(), password.clone()),
                _ => http::Auth::None,
            };
            Arc::new(
                HttpSink::new(&sink.name, url, auth, timeout)
                    .with_context(|| format!("Failed to build http sink '{}'", sink.name))?,
            )
        }
        SinkKind::Jsonl { file } => Arc::new(JsonlSink::new(&sink.name, file)),
        SinkKind::Log => Arc::new(LogSink::new(&sink.name)),
    })
}

/// Instantiate every configured sink, keyed by name
pub fn build_sinks(config: &Config) -> anyhow::Result<SinkMap> {
    let mut sinks = SinkMap::default();
    for sink in config.sinks() {
        if sinks.insert(sink.name.clone(), build_sink(config, sink)?).is_some() {
            anyhow::bail!("duplicate sink name '{}'", sink.name);
        }
    }
    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds_log_sink() {
        let sinks = build_sinks(&Config::default()).unwrap();
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks["log"].name(), "log");
    }

    #[test]
    fn test_duplicate_sink_names_are_rejected() {
        let log = SinkConfig {
            name: "dup".to_string(),
            kind: SinkKind::Log,
            timeout_ms: None,
            retry: None,
            breaker: None,
        };
        let config = Config::default().with_sinks(vec![log.clone(), log]);
        assert!(build_sinks(&config).is_err());
    }
}
