//! Infrastructure - configuration, metrics, logging and broker
//!
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `logging` - tracing subscriber setup
//! - `broker` - Embedded MQTT broker (rumqttd)

pub mod broker;
pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{
    BreakerConfig, Config, EventField, PredicateConfig, RetryConfig, RuleConfig, SinkConfig,
    SinkKind,
};
pub use metrics::Metrics;
