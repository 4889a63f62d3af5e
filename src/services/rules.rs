//! Rule engine: decides which sinks receive an event
//!
//! Rules are compiled once from configuration into a predicate tree and
//! evaluated by a pure interpreter. Every rule is evaluated in declared
//! order (match-all); targets are deduplicated per sink keeping the first
//! appearance, and `notify` is OR-ed across the rules that selected a sink.
//! An event matching no rule still gets audited, it just reaches no sink.

use crate::domain::error::RuleError;
use crate::domain::types::ScanEvent;
use crate::infra::config::{Config, EventField, PredicateConfig, RuleConfig};
use chrono::{FixedOffset, NaiveTime, Offset, Utc};
use smallvec::SmallVec;
use std::collections::HashSet;
use tracing::debug;

/// One sink selected for an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub sink: String,
    pub notify: bool,
}

pub type Routes = SmallVec<[RouteTarget; 4]>;

fn field_value<'a>(field: EventField, event: &'a ScanEvent) -> &'a str {
    match field {
        EventField::ObjectId => &event.object_id,
        EventField::LocationId => &event.location_id,
        EventField::ScannerId => &event.scanner_id,
        EventField::Category => &event.category,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Always,
    Eq { field: EventField, value: String },
    In { field: EventField, values: HashSet<String> },
    /// Half-open `[start, end)`; wraps midnight when `end <= start`
    TimeRange { start: NaiveTime, end: NaiveTime },
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

fn parse_time(rule: &str, value: &str) -> Result<NaiveTime, RuleError> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| RuleError::InvalidTime { rule: rule.to_string(), value: value.to_string() })
}

impl Predicate {
    fn compile(rule: &str, config: &PredicateConfig) -> Result<Self, RuleError> {
        Ok(match config {
            PredicateConfig::Always => Predicate::Always,
            PredicateConfig::Eq { field, value } => Predicate::Eq { field: *field, value: value.clone() },
            PredicateConfig::In { field, values } => {
                Predicate::In { field: *field, values: values.iter().cloned().collect() }
            }
            PredicateConfig::TimeRange { start, end } => Predicate::TimeRange {
                start: parse_time(rule, start)?,
                end: parse_time(rule, end)?,
            },
            PredicateConfig::All { of } => {
                Predicate::All(of.iter().map(|p| Self::compile(rule, p)).collect::<Result<_, _>>()?)
            }
            PredicateConfig::Any { of } => {
                Predicate::Any(of.iter().map(|p| Self::compile(rule, p)).collect::<Result<_, _>>()?)
            }
            PredicateConfig::Not { of } => Predicate::Not(Box::new(Self::compile(rule, of)?)),
        })
    }

    fn matches(&self, event: &ScanEvent, time_of_day: NaiveTime) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Eq { field, value } => field_value(*field, event) == value,
            Predicate::In { field, values } => values.contains(field_value(*field, event)),
            Predicate::TimeRange { start, end } => {
                if start < end {
                    *start <= time_of_day && time_of_day < *end
                } else {
                    time_of_day >= *start || time_of_day < *end
                }
            }
            // empty `all` is vacuously true, empty `any` is false
            Predicate::All(preds) => preds.iter().all(|p| p.matches(event, time_of_day)),
            Predicate::Any(preds) => preds.iter().any(|p| p.matches(event, time_of_day)),
            Predicate::Not(pred) => !pred.matches(event, time_of_day),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    name: String,
    predicate: Predicate,
    sinks: Vec<String>,
    notify: bool,
}

impl Rule {
    pub fn compile(config: &RuleConfig, known_sinks: &HashSet<&str>) -> Result<Self, RuleError> {
        if config.sinks.is_empty() {
            return Err(RuleError::NoTargets { rule: config.name.clone() });
        }
        if let Some(sink) = config.sinks.iter().find(|s| !known_sinks.contains(s.as_str())) {
            return Err(RuleError::UnknownSink { rule: config.name.clone(), sink: sink.clone() });
        }
        let predicate = match &config.when {
            Some(when) => Predicate::compile(&config.name, when)?,
            None => Predicate::Always,
        };
        Ok(Self { name: config.name.clone(), predicate, sinks: config.sinks.clone(), notify: config.notify })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<Rule>,
    offset: FixedOffset,
}

impl RuleEngine {
    pub fn compile(
        configs: &[RuleConfig],
        known_sinks: &HashSet<&str>,
        utc_offset_minutes: i32,
    ) -> Result<Self, RuleError> {
        let rules = configs
            .iter()
            .map(|config| Rule::compile(config, known_sinks))
            .collect::<Result<Vec<_>, _>>()?;
        let offset = FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix());
        Ok(Self { rules, offset })
    }

    pub fn from_config(config: &Config) -> Result<Self, RuleError> {
        let known: HashSet<&str> = config.sinks().iter().map(|s| s.name.as_str()).collect();
        Self::compile(config.rules(), &known, config.utc_offset_minutes())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Ordered, deduplicated sink targets for an event
    pub fn evaluate(&self, event: &ScanEvent) -> Routes {
        let time_of_day = event.observed_at.with_timezone(&self.offset).time();
        let mut routes = Routes::new();

        for rule in &self.rules {
            if !rule.predicate.matches(event, time_of_day) {
                continue;
            }
            debug!(rule = %rule.name, event = %event.event_ref(), "rule_matched");
            for sink in &rule.sinks {
                match routes.iter_mut().find(|t| &t.sink == sink) {
                    Some(existing) => existing.notify |= rule.notify,
                    None => routes.push(RouteTarget { sink: sink.clone(), notify: rule.notify }),
                }
            }
        }
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use uuid::Uuid;

    fn sinks() -> HashSet<&'static str> {
        ["search-index", "audit", "crm", "mail"].into_iter().collect()
    }

    fn event_at(category: &str, location: &str, observed_at: DateTime<Utc>) -> ScanEvent {
        ScanEvent {
            event_id: Uuid::now_v7(),
            scanner_id: "pi-dock".to_string(),
            sequence_no: 1,
            object_id: "OBJ002".to_string(),
            object_name: "Laptop".to_string(),
            category: category.to_string(),
            location_id: location.to_string(),
            location_name: location.to_string(),
            observed_at,
        }
    }

    fn event(category: &str, location: &str) -> ScanEvent {
        event_at(category, location, Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap())
    }

    fn rule(name: &str, when: Option<PredicateConfig>, sinks: &[&str], notify: bool) -> RuleConfig {
        RuleConfig {
            name: name.to_string(),
            when,
            sinks: sinks.iter().map(|s| s.to_string()).collect(),
            notify,
        }
    }

    fn eq(field: EventField, value: &str) -> PredicateConfig {
        PredicateConfig::Eq { field, value: value.to_string() }
    }

    fn names(routes: &Routes) -> Vec<&str> {
        routes.iter().map(|t| t.sink.as_str()).collect()
    }

    #[test]
    fn test_personal_item_reaches_both_sinks() {
        let engine = RuleEngine::compile(
            &[
                rule("personal", Some(eq(EventField::Category, "personal")), &["search-index"], false),
                rule("all", Some(PredicateConfig::Always), &["audit"], false),
            ],
            &sinks(),
            0,
        )
        .unwrap();

        assert_eq!(names(&engine.evaluate(&event("personal", "LOC002"))), vec!["search-index", "audit"]);
        assert_eq!(names(&engine.evaluate(&event("av", "LOC002"))), vec!["audit"]);
    }

    #[test]
    fn test_no_match_yields_no_targets() {
        let engine = RuleEngine::compile(
            &[rule("personal", Some(eq(EventField::Category, "personal")), &["crm"], false)],
            &sinks(),
            0,
        )
        .unwrap();
        assert!(engine.evaluate(&event("av", "LOC001")).is_empty());
    }

    #[test]
    fn test_dedup_keeps_first_position_and_ors_notify() {
        let engine = RuleEngine::compile(
            &[
                rule("a", None, &["crm", "audit"], false),
                rule("b", None, &["audit", "mail"], true),
            ],
            &sinks(),
            0,
        )
        .unwrap();
        let routes = engine.evaluate(&event("av", "LOC001"));
        assert_eq!(names(&routes), vec!["crm", "audit", "mail"]);
        assert!(!routes[0].notify);
        assert!(routes[1].notify);
        assert!(routes[2].notify);
    }

    #[test]
    fn test_in_and_not_predicates() {
        let restricted = PredicateConfig::In {
            field: EventField::LocationId,
            values: vec!["LOC002".to_string(), "LOC009".to_string()],
        };
        let engine = RuleEngine::compile(
            &[
                rule("restricted", Some(restricted.clone()), &["mail"], true),
                rule("open", Some(PredicateConfig::Not { of: Box::new(restricted) }), &["audit"], false),
            ],
            &sinks(),
            0,
        )
        .unwrap();
        assert_eq!(names(&engine.evaluate(&event("av", "LOC002"))), vec!["mail"]);
        assert_eq!(names(&engine.evaluate(&event("av", "LOC001"))), vec!["audit"]);
    }

    #[test]
    fn test_time_range_wraps_midnight() {
        let after_hours = PredicateConfig::TimeRange { start: "20:00".to_string(), end: "06:00".to_string() };
        let engine =
            RuleEngine::compile(&[rule("after-hours", Some(after_hours), &["mail"], true)], &sinks(), 0).unwrap();

        let at = |h, m| event_at("av", "LOC001", Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap());
        assert_eq!(engine.evaluate(&at(22, 30)).len(), 1);
        assert_eq!(engine.evaluate(&at(3, 0)).len(), 1);
        assert_eq!(engine.evaluate(&at(20, 0)).len(), 1);
        assert!(engine.evaluate(&at(6, 0)).is_empty());
        assert!(engine.evaluate(&at(12, 0)).is_empty());
    }

    #[test]
    fn test_time_range_uses_configured_offset() {
        let office = PredicateConfig::TimeRange { start: "09:00".to_string(), end: "17:00".to_string() };
        // UTC+2: 07:30Z is 09:30 local
        let engine = RuleEngine::compile(&[rule("office", Some(office), &["crm"], false)], &sinks(), 120).unwrap();
        let ev = event_at("av", "LOC001", Utc.with_ymd_and_hms(2026, 3, 2, 7, 30, 0).unwrap());
        assert_eq!(engine.evaluate(&ev).len(), 1);
        let ev = event_at("av", "LOC001", Utc.with_ymd_and_hms(2026, 3, 2, 15, 30, 0).unwrap());
        assert!(engine.evaluate(&ev).is_empty());
    }

    #[test]
    fn test_all_and_any() {
        let both = PredicateConfig::All {
            of: vec![eq(EventField::Category, "personal"), eq(EventField::ScannerId, "pi-dock")],
        };
        let either = PredicateConfig::Any {
            of: vec![eq(EventField::ObjectId, "OBJ999"), eq(EventField::LocationId, "LOC002")],
        };
        let engine = RuleEngine::compile(
            &[rule("both", Some(both), &["crm"], false), rule("either", Some(either), &["mail"], false)],
            &sinks(),
            0,
        )
        .unwrap();
        assert_eq!(names(&engine.evaluate(&event("personal", "LOC002"))), vec!["crm", "mail"]);
        assert!(engine.evaluate(&event("av", "LOC001")).is_empty());
    }

    #[test]
    fn test_unknown_sink_is_rejected() {
        let err = RuleEngine::compile(&[rule("r", None, &["nowhere"], false)], &sinks(), 0).unwrap_err();
        assert_eq!(err, RuleError::UnknownSink { rule: "r".to_string(), sink: "nowhere".to_string() });
    }

    #[test]
    fn test_bad_time_is_rejected() {
        let bad = PredicateConfig::TimeRange { start: "25:00".to_string(), end: "06:00".to_string() };
        let err = RuleEngine::compile(&[rule("r", Some(bad), &["mail"], false)], &sinks(), 0).unwrap_err();
        assert!(matches!(err, RuleError::InvalidTime { value, .. } if value == "25:00"));
    }

    #[test]
    fn test_rule_without_sinks_is_rejected() {
        let err = RuleEngine::compile(&[rule("r", None, &[], false)], &sinks(), 0).unwrap_err();
        assert_eq!(err, RuleError::NoTargets { rule: "r".to_string() });
    }

    #[test]
    fn test_default_config_compiles() {
        let engine = RuleEngine::from_config(&Config::default()).unwrap();
        assert_eq!(engine.rules().len(), 1);
        assert_eq!(engine.rules()[0].name(), "catch-all");
    }
}
