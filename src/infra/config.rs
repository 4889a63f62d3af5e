//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::registry::CodeRegistry;
use crate::domain::types::TrackedObject;
use anyhow::Context;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Topic scan events are published to and consumed from
    #[serde(default = "default_scan_topic")]
    pub scan_topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_scan_topic() -> String {
    "assets/scans".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Run an embedded broker (single-node deployments)
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: false, bind_address: default_broker_bind_address(), port: default_broker_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
    /// Offset applied before evaluating time-of-day rules
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id(), utc_offset_minutes: 0 }
    }
}

fn default_site_id() -> String {
    "assets".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_scanner_id")]
    pub id: String,
    #[serde(default = "default_debounce_window_ms")]
    pub debounce_window_ms: u64,
    /// Upper bound on remembered (object, location) pairs
    #[serde(default = "default_debounce_capacity")]
    pub debounce_capacity: usize,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            id: default_scanner_id(),
            debounce_window_ms: default_debounce_window_ms(),
            debounce_capacity: default_debounce_capacity(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

fn default_scanner_id() -> String {
    "scanner-1".to_string()
}

fn default_debounce_window_ms() -> u64 {
    5000
}

fn default_debounce_capacity() -> usize {
    1024
}

fn default_status_interval_secs() -> u64 {
    30
}

/// Location entries accept either a bare display name or a table
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LocationEntry {
    Name(String),
    Detailed { name: String },
}

impl LocationEntry {
    pub fn name(&self) -> &str {
        match self {
            LocationEntry::Name(name) | LocationEntry::Detailed { name } => name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    #[serde(alias = "type")]
    pub category: String,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CodesConfig {
    #[serde(default)]
    pub locations: BTreeMap<String, LocationEntry>,
    #[serde(default)]
    pub objects: BTreeMap<String, ObjectEntry>,
}

/// Event field a rule predicate can inspect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventField {
    ObjectId,
    LocationId,
    ScannerId,
    Category,
}

/// Predicate tree as written in the config file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PredicateConfig {
    Always,
    Eq { field: EventField, value: String },
    In { field: EventField, values: Vec<String> },
    TimeRange { start: String, end: String },
    All { of: Vec<PredicateConfig> },
    Any { of: Vec<PredicateConfig> },
    Not { of: Box<PredicateConfig> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    /// Omitted predicate matches every event
    #[serde(default)]
    pub when: Option<PredicateConfig>,
    pub sinks: Vec<String>,
    #[serde(default)]
    pub notify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: default_failure_threshold(), cooldown_ms: default_cooldown_ms() }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkKind {
    /// JSON POST to an HTTP endpoint (search index, CRM, directory bridge)
    Http {
        url: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        bearer_token: Option<String>,
    },
    /// Append-only JSONL file
    Jsonl { file: String },
    /// Structured log line only
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SinkConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: SinkKind,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Events whose fan-out may be in progress at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_sink_timeout_ms")]
    pub sink_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            sink_timeout_ms: default_sink_timeout_ms(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

fn default_max_in_flight() -> usize {
    32
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_sink_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_database")]
    pub database: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    /// Abandoned deliveries per hour above which maintenance raises an alert (0 disables)
    #[serde(default = "default_alert_abandoned_per_hour")]
    pub alert_abandoned_per_hour: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            database: default_audit_database(),
            retention_days: default_retention_days(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            alert_abandoned_per_hour: default_alert_abandoned_per_hour(),
        }
    }
}

fn default_audit_database() -> String {
    "asset_audit.db".to_string()
}

fn default_retention_days() -> u32 {
    90
}

fn default_maintenance_interval_secs() -> u64 {
    3600
}

fn default_alert_abandoned_per_hour() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    #[serde(default = "default_mqtt_egress_enabled")]
    pub enabled: bool,
    /// Topic for processed location updates of notify-worthy events (QoS 1)
    #[serde(default = "default_updates_topic")]
    pub updates_topic: String,
    /// Topic for abandoned dispatch alerts (QoS 1)
    #[serde(default = "default_alerts_topic")]
    pub alerts_topic: String,
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self {
            enabled: default_mqtt_egress_enabled(),
            updates_topic: default_updates_topic(),
            alerts_topic: default_alerts_topic(),
        }
    }
}

fn default_mqtt_egress_enabled() -> bool {
    true
}

fn default_updates_topic() -> String {
    "assets/location-updates".to_string()
}

fn default_alerts_topic() -> String {
    "assets/alerts".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

fn default_prometheus_port() -> u16 {
    9464
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub codes: CodesConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    utc_offset_minutes: i32,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_scan_topic: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    scanner_id: String,
    debounce_window_ms: u64,
    debounce_capacity: usize,
    scanner_status_interval_secs: u64,
    codes: CodesConfig,
    rules: Vec<RuleConfig>,
    sinks: Vec<SinkConfig>,
    max_in_flight: usize,
    shutdown_grace_ms: u64,
    sink_timeout_ms: u64,
    retry: RetryConfig,
    breaker: BreakerConfig,
    audit_database: String,
    retention_days: u32,
    maintenance_interval_secs: u64,
    alert_abandoned_per_hour: u32,
    mqtt_egress_enabled: bool,
    mqtt_egress_updates_topic: String,
    mqtt_egress_alerts_topic: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let dispatch = DispatchConfig::default();
        let audit = AuditConfig::default();
        let egress = MqttEgressConfig::default();
        let scanner = ScannerConfig::default();
        Self {
            site_id: default_site_id(),
            utc_offset_minutes: 0,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_scan_topic: default_scan_topic(),
            mqtt_username: None,
            mqtt_password: None,
            broker_enabled: false,
            broker_bind_address: default_broker_bind_address(),
            broker_port: default_broker_port(),
            scanner_id: scanner.id,
            debounce_window_ms: scanner.debounce_window_ms,
            debounce_capacity: scanner.debounce_capacity,
            scanner_status_interval_secs: scanner.status_interval_secs,
            codes: CodesConfig::default(),
            rules: Self::default_rules(),
            sinks: Self::default_sinks(),
            max_in_flight: dispatch.max_in_flight,
            shutdown_grace_ms: dispatch.shutdown_grace_ms,
            sink_timeout_ms: dispatch.sink_timeout_ms,
            retry: dispatch.retry,
            breaker: dispatch.breaker,
            audit_database: audit.database,
            retention_days: audit.retention_days,
            maintenance_interval_secs: audit.maintenance_interval_secs,
            alert_abandoned_per_hour: audit.alert_abandoned_per_hour,
            mqtt_egress_enabled: egress.enabled,
            mqtt_egress_updates_topic: egress.updates_topic,
            mqtt_egress_alerts_topic: egress.alerts_topic,
            metrics_interval_secs: default_metrics_interval_secs(),
            prometheus_port: default_prometheus_port(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Without a config file every accepted event still lands in a local log
    fn default_rules() -> Vec<RuleConfig> {
        vec![RuleConfig {
            name: "catch-all".to_string(),
            when: None,
            sinks: vec!["log".to_string()],
            notify: false,
        }]
    }

    fn default_sinks() -> Vec<SinkConfig> {
        vec![SinkConfig {
            name: "log".to_string(),
            kind: SinkKind::Log,
            timeout_ms: None,
            retry: None,
            breaker: None,
        }]
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, source: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig =
            toml::from_str(content).with_context(|| format!("Failed to parse config file {source}"))?;

        Ok(Self {
            site_id: toml_config.site.id,
            utc_offset_minutes: toml_config.site.utc_offset_minutes,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_scan_topic: toml_config.mqtt.scan_topic,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            scanner_id: toml_config.scanner.id,
            debounce_window_ms: toml_config.scanner.debounce_window_ms,
            debounce_capacity: toml_config.scanner.debounce_capacity,
            scanner_status_interval_secs: toml_config.scanner.status_interval_secs,
            codes: toml_config.codes,
            rules: toml_config.rules,
            sinks: toml_config.sinks,
            max_in_flight: toml_config.dispatch.max_in_flight.max(1),
            shutdown_grace_ms: toml_config.dispatch.shutdown_grace_ms,
            sink_timeout_ms: toml_config.dispatch.sink_timeout_ms,
            retry: toml_config.dispatch.retry,
            breaker: toml_config.dispatch.breaker,
            audit_database: toml_config.audit.database,
            retention_days: toml_config.audit.retention_days,
            maintenance_interval_secs: toml_config.audit.maintenance_interval_secs,
            alert_abandoned_per_hour: toml_config.audit.alert_abandoned_per_hour,
            mqtt_egress_enabled: toml_config.mqtt_egress.enabled,
            mqtt_egress_updates_topic: toml_config.mqtt_egress.updates_topic,
            mqtt_egress_alerts_topic: toml_config.mqtt_egress.alerts_topic,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: source.to_string(),
        })
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Build the immutable code registry from the `[codes]` tables
    pub fn registry(&self) -> CodeRegistry {
        let mut registry = CodeRegistry::new();
        for (code, entry) in &self.codes.locations {
            registry.insert_location(code, entry.name());
        }
        for (code, entry) in &self.codes.objects {
            registry.insert_object(TrackedObject {
                id: code.clone(),
                display_name: entry.name.clone(),
                category: entry.category.clone(),
                serial: entry.serial.clone(),
                owner: entry.owner.clone(),
            });
        }
        registry
    }

    /// Retry policy for a sink, honouring per-sink overrides
    pub fn retry_for(&self, sink: &SinkConfig) -> RetryConfig {
        sink.retry.unwrap_or(self.retry)
    }

    /// Breaker policy for a sink, honouring per-sink overrides
    pub fn breaker_for(&self, sink: &SinkConfig) -> BreakerConfig {
        sink.breaker.unwrap_or(self.breaker)
    }

    pub fn sink_timeout_ms_for(&self, sink: &SinkConfig) -> u64 {
        sink.timeout_ms.unwrap_or(self.sink_timeout_ms)
    }

    pub fn sink_names(&self) -> HashMap<&str, &SinkConfig> {
        self.sinks.iter().map(|s| (s.name.as_str(), s)).collect()
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn utc_offset_minutes(&self) -> i32 {
        self.utc_offset_minutes
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_scan_topic(&self) -> &str {
        &self.mqtt_scan_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn scanner_id(&self) -> &str {
        &self.scanner_id
    }

    pub fn debounce_window_ms(&self) -> u64 {
        self.debounce_window_ms
    }

    pub fn debounce_capacity(&self) -> usize {
        self.debounce_capacity
    }

    pub fn scanner_status_interval_secs(&self) -> u64 {
        self.scanner_status_interval_secs
    }

    pub fn rules(&self) -> &[RuleConfig] {
        &self.rules
    }

    pub fn sinks(&self) -> &[SinkConfig] {
        &self.sinks
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn shutdown_grace_ms(&self) -> u64 {
        self.shutdown_grace_ms
    }

    pub fn retry(&self) -> RetryConfig {
        self.retry
    }

    pub fn breaker(&self) -> BreakerConfig {
        self.breaker
    }

    pub fn audit_database(&self) -> &str {
        &self.audit_database
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    pub fn maintenance_interval_secs(&self) -> u64 {
        self.maintenance_interval_secs
    }

    pub fn alert_abandoned_per_hour(&self) -> u32 {
        self.alert_abandoned_per_hour
    }

    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress_enabled
    }

    pub fn mqtt_egress_updates_topic(&self) -> &str {
        &self.mqtt_egress_updates_topic
    }

    pub fn mqtt_egress_alerts_topic(&self) -> &str {
        &self.mqtt_egress_alerts_topic
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to replace the sink list
    pub fn with_sinks(mut self, sinks: Vec<SinkConfig>) -> Self {
        self.sinks = sinks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[site]
id = "depot"
utc_offset_minutes = 120

[mqtt]
host = "broker.local"
port = 1884

[scanner]
id = "pi-dock"
debounce_window_ms = 3000

[codes.locations]
LOC001 = "Loading Dock"
LOC002 = { name = "Server Room" }

[codes.objects.OBJ002]
name = "Laptop"
category = "personal"
owner = "IT"

[codes.objects.OBJ004]
name = "Fire Extinguisher"
type = "Safety Equipment"
serial = "FE789123456"

[[rules]]
name = "personal-items"
sinks = ["search-index"]
when = { op = "eq", field = "category", value = "personal" }

[[rules]]
name = "after-hours"
sinks = ["mail"]
notify = true
when = { op = "all", of = [
    { op = "time_range", start = "20:00", end = "06:00" },
    { op = "not", of = { op = "in", field = "location_id", values = ["LOC001"] } },
] }

[[rules]]
name = "catch-all"
sinks = ["audit"]

[[sinks]]
name = "search-index"
kind = "http"
url = "http://solr.local:8983/solr/assets/update/json/docs"
timeout_ms = 5000
retry = { max_attempts = 5 }

[[sinks]]
name = "audit"
kind = "jsonl"
file = "audit.jsonl"

[[sinks]]
name = "mail"
kind = "log"
breaker = { failure_threshold = 2, cooldown_ms = 1000 }

[dispatch]
max_in_flight = 8
retry = { max_attempts = 4, base_delay_ms = 100 }
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mqtt_host(), "localhost");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.mqtt_scan_topic(), "assets/scans");
        assert_eq!(config.debounce_window_ms(), 5000);
        assert_eq!(config.retry().max_attempts, 3);
        assert_eq!(config.breaker().failure_threshold, 5);
        assert_eq!(config.rules().len(), 1);
        assert_eq!(config.sinks()[0].kind, SinkKind::Log);
    }

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE, "sample").unwrap();
        assert_eq!(config.site_id(), "depot");
        assert_eq!(config.utc_offset_minutes(), 120);
        assert_eq!(config.scanner_id(), "pi-dock");
        assert_eq!(config.debounce_window_ms(), 3000);
        assert_eq!(config.max_in_flight(), 8);
        assert_eq!(config.rules().len(), 3);
        assert!(config.rules()[2].when.is_none());
        assert!(config.rules()[1].notify);
        assert_eq!(config.sinks().len(), 3);
    }

    #[test]
    fn test_registry_from_codes() {
        let config = Config::from_toml_str(SAMPLE, "sample").unwrap();
        let registry = config.registry();
        assert_eq!(registry.location_count(), 2);
        assert_eq!(registry.location("LOC002").unwrap().display_name, "Server Room");
        let extinguisher = registry.object("OBJ004").unwrap();
        assert_eq!(extinguisher.category, "Safety Equipment");
        assert_eq!(extinguisher.serial.as_deref(), Some("FE789123456"));
    }

    #[test]
    fn test_nested_predicate_parses() {
        let config = Config::from_toml_str(SAMPLE, "sample").unwrap();
        let Some(PredicateConfig::All { of }) = &config.rules()[1].when else {
            panic!("expected all predicate");
        };
        assert_eq!(of.len(), 2);
        assert!(matches!(of[1], PredicateConfig::Not { .. }));
    }

    #[test]
    fn test_per_sink_overrides() {
        let config = Config::from_toml_str(SAMPLE, "sample").unwrap();
        let sinks = config.sink_names();

        let search = sinks["search-index"];
        assert_eq!(config.retry_for(search).max_attempts, 5);
        assert_eq!(config.retry_for(search).base_delay_ms, 500);
        assert_eq!(config.sink_timeout_ms_for(search), 5000);

        let audit = sinks["audit"];
        assert_eq!(config.retry_for(audit).max_attempts, 4);
        assert_eq!(config.retry_for(audit).base_delay_ms, 100);

        let mail = sinks["mail"];
        assert_eq!(config.breaker_for(mail).failure_threshold, 2);
        assert_eq!(config.breaker_for(audit).failure_threshold, 5);
    }

    #[test]
    fn test_http_sink_kind() {
        let config = Config::from_toml_str(SAMPLE, "sample").unwrap();
        assert!(matches!(
            &config.sinks()[0].kind,
            SinkKind::Http { url, .. } if url.ends_with("/update/json/docs")
        ));
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["asset-router".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> =
            vec!["asset-router".to_string(), "--config".to_string(), "config/depot.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/depot.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["asset-router".to_string(), "--config=config/depot.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/depot.toml");
    }

    #[test]
    fn test_missing_mqtt_section_is_an_error() {
        assert!(Config::from_toml_str("[site]\nid = \"x\"\n", "broken").is_err());
    }
}
