//! Per-sink circuit breaker
//!
//! `closed -> open` after `failure_threshold` consecutive failures.
//! While open every call is rejected without touching the sink. Once the
//! cool-down has elapsed the next caller becomes the single half-open trial:
//! success closes the breaker, failure re-opens it for another cool-down.
//!
//! State sits behind a short `parking_lot` lock shared by every dispatch of
//! the sink. Callers racing a transition may observe a stale state, which
//! costs at most one extra attempt.

use crate::infra::config::BreakerConfig;
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

/// Permission to call the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The one half-open probe; its outcome decides the breaker state
    Trial,
    Rejected,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    sink: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
    metrics: Option<Arc<Metrics>>,
}

impl CircuitBreaker {
    pub fn new(sink: &str, config: BreakerConfig) -> Self {
        Self {
            sink: sink.to_string(),
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_millis(config.cooldown_ms),
            inner: Mutex::new(Inner { state: BreakerState::Closed, consecutive_failures: 0 }),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    inner.state = BreakerState::HalfOpen { trial_in_flight: true };
                    info!(sink = %self.sink, "breaker_half_open");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen { trial_in_flight: true } => Admission::Rejected,
            BreakerState::HalfOpen { trial_in_flight: false } => {
                inner.state = BreakerState::HalfOpen { trial_in_flight: true };
                Admission::Trial
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            if let Some(m) = &self.metrics {
                m.breaker_closed();
            }
            info!(sink = %self.sink, "breaker_closed");
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let until = Instant::now() + self.cooldown;
        match inner.state {
            BreakerState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                inner.state = BreakerState::Open { until };
                if let Some(m) = &self.metrics {
                    m.breaker_opened();
                }
                warn!(
                    sink = %self.sink,
                    failures = %inner.consecutive_failures,
                    cooldown_ms = %self.cooldown.as_millis(),
                    "breaker_opened"
                );
            }
            BreakerState::HalfOpen { .. } => {
                inner.state = BreakerState::Open { until };
                warn!(sink = %self.sink, "breaker_reopened");
            }
            _ => {}
        }
    }

    /// Give back a trial whose attempt was cancelled before it had an outcome
    pub fn release(&self, admission: Admission) {
        if admission != Admission::Trial {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state == (BreakerState::HalfOpen { trial_in_flight: true }) {
            inner.state = BreakerState::HalfOpen { trial_in_flight: false };
        }
    }
}
