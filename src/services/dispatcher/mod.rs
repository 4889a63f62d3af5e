//! Sink dispatcher - fans one event out to its routed sinks
//!
//! Every (event, sink) delivery runs as its own task, so a slow or failing
//! sink never holds back the others. Each delivery:
//! - skips the sink when the audit store already shows a terminal status
//! - asks the sink's circuit breaker for admission (open = abandon at once)
//! - calls the sink under the sink's timeout (a timeout is retriable)
//! - backs off exponentially between retriable failures
//! - persists every status change: `pending -> failed -> retrying* -> delivered | abandoned`
//!
//! A force-stop signal interrupts backoff sleeps and in-flight calls; the
//! delivery is persisted as resumable and picked up again on next start.

mod breaker;
mod retry;
#[cfg(test)]
mod tests;

pub use breaker::{Admission, BreakerState, CircuitBreaker};
pub use retry::RetryPolicy;

use crate::domain::error::SinkError;
use crate::domain::types::{DispatchRecord, DispatchStatus, ScanEvent};
use crate::infra::config::{BreakerConfig, Config, RetryConfig};
use crate::infra::metrics::Metrics;
use crate::io::audit::AuditStore;
use crate::io::egress_channel::{AlertPayload, EgressSender, LocationUpdatePayload};
use crate::io::sinks::{Sink, SinkMap};
use crate::services::rules::RouteTarget;
use chrono::Utc;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Sink plus the delivery policy that applies to it
pub struct SinkHandle {
    sink: Arc<dyn Sink>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl SinkHandle {
    pub fn new(sink: Arc<dyn Sink>, retry: RetryConfig, breaker: BreakerConfig, timeout: Duration) -> Self {
        let breaker = CircuitBreaker::new(sink.name(), breaker);
        Self { sink, retry: RetryPolicy::new(retry), breaker, timeout }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

/// How one (event, sink) delivery ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    Abandoned { attempts: u32, reason: String },
    /// Already terminal in the audit store
    Skipped(DispatchStatus),
    /// Force-stopped; persisted as resumable
    Interrupted { attempts: u32 },
    UnknownSink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkOutcome {
    pub sink: String,
    pub outcome: DispatchOutcome,
}

pub struct Dispatcher {
    sinks: FxHashMap<String, Arc<SinkHandle>>,
    audit: AuditStore,
    metrics: Arc<Metrics>,
    egress: Option<EgressSender>,
    force_stop: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(audit: AuditStore, metrics: Arc<Metrics>, force_stop: watch::Receiver<bool>) -> Self {
        Self { sinks: FxHashMap::default(), audit, metrics, egress: None, force_stop }
    }

    /// Wire every built sink with its configured retry, breaker and timeout
    pub fn from_config(
        config: &Config,
        sinks: SinkMap,
        audit: AuditStore,
        metrics: Arc<Metrics>,
        force_stop: watch::Receiver<bool>,
    ) -> Self {
        let mut dispatcher = Self::new(audit, metrics, force_stop);
        for sink_config in config.sinks() {
            let Some(sink) = sinks.get(&sink_config.name) else {
                continue;
            };
            dispatcher.add_sink(SinkHandle::new(
                sink.clone(),
                config.retry_for(sink_config),
                config.breaker_for(sink_config),
                Duration::from_millis(config.sink_timeout_ms_for(sink_config)),
            ));
        }
        info!(sinks = %dispatcher.sinks.len(), "dispatcher_initialized");
        dispatcher
    }

    pub fn with_egress(mut self, egress: EgressSender) -> Self {
        self.egress = Some(egress);
        self
    }

    pub fn add_sink(&mut self, mut handle: SinkHandle) {
        handle.breaker = handle.breaker.with_metrics(self.metrics.clone());
        self.sinks.insert(handle.sink.name().to_string(), Arc::new(handle));
    }

    pub fn sink(&self, name: &str) -> Option<&SinkHandle> {
        self.sinks.get(name).map(|h| h.as_ref())
    }

    pub fn audit(&self) -> &AuditStore {
        &self.audit
    }

    /// Deliver one event to all its targets concurrently
    ///
    /// Returns when every delivery has reached a terminal status or has been
    /// interrupted. When any notify-worthy target was delivered, one location
    /// update is published with `previous_location`.
    pub async fn dispatch(
        self: &Arc<Self>,
        event: Arc<ScanEvent>,
        targets: &[RouteTarget],
        previous_location: Option<String>,
    ) -> Vec<SinkOutcome> {
        self.metrics.dispatch_started();
        let mut set = JoinSet::new();
        for target in targets {
            let this = Arc::clone(self);
            let event = Arc::clone(&event);
            let target = target.clone();
            set.spawn(async move {
                let outcome = this.deliver(&event, &target).await;
                (target, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(targets.len());
        let mut notify_delivered = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((target, outcome)) => {
                    if target.notify && matches!(outcome, DispatchOutcome::Delivered { .. }) {
                        notify_delivered = true;
                    }
                    outcomes.push(SinkOutcome { sink: target.sink, outcome });
                }
                Err(e) => error!(event = %event.event_ref(), error = %e, "delivery_task_failed"),
            }
        }

        if notify_delivered {
            if let Some(egress) = &self.egress {
                egress.send_location_update(LocationUpdatePayload::from_event(&event, previous_location));
            }
        }
        self.metrics.dispatch_finished();
        outcomes
    }

    /// Drive one (event, sink) delivery to a terminal or resumable status
    pub async fn deliver(&self, event: &ScanEvent, target: &RouteTarget) -> DispatchOutcome {
        let event_ref = event.event_ref();
        let sink_name = target.sink.as_str();
        let Some(handle) = self.sinks.get(sink_name) else {
            error!(event = %event_ref, sink = %sink_name, "dispatch_unknown_sink");
            return DispatchOutcome::UnknownSink;
        };

        let existing = match self.audit.dispatch_status(&event_ref, sink_name).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(event = %event_ref, sink = %sink_name, error = %e, "dispatch_status_lookup_failed");
                None
            }
        };
        if let Some(record) = &existing {
            if record.last_status.is_terminal() {
                debug!(event = %event_ref, sink = %sink_name, status = %record.last_status, "dispatch_skipped");
                return DispatchOutcome::Skipped(record.last_status);
            }
        }

        let mut record = existing.unwrap_or_else(|| DispatchRecord::pending(event_ref.clone(), sink_name, target.notify));
        let max_attempts = handle.retry.max_attempts();
        // a resumed delivery keeps at least one attempt
        record.attempt_count = record.attempt_count.min(max_attempts - 1);
        // left failed by a crash mid-backoff; the next attempt is a retry
        if record.last_status == DispatchStatus::Failed {
            self.persist(&mut record, DispatchStatus::Retrying).await;
        }

        self.attempt_loop(handle, event, &mut record).await
    }

    async fn attempt_loop(&self, handle: &SinkHandle, event: &ScanEvent, record: &mut DispatchRecord) -> DispatchOutcome {
        let mut force_stop = self.force_stop.clone();
        loop {
            if *force_stop.borrow() {
                return self.interrupt(record).await;
            }

            let admission = handle.breaker.try_acquire();
            if admission == Admission::Rejected {
                self.metrics.record_short_circuit();
                return self.abandon(event, record, "circuit open".to_string()).await;
            }

            record.attempt_count += 1;
            let started = Instant::now();
            let result = tokio::select! {
                result = tokio::time::timeout(handle.timeout, handle.sink.send(event)) => {
                    result.unwrap_or_else(|_| {
                        Err(SinkError::Retriable(format!("timed out after {}ms", handle.timeout.as_millis())))
                    })
                }
                _ = wait_for_stop(&mut force_stop) => {
                    handle.breaker.release(admission);
                    return self.interrupt(record).await;
                }
            };

            match result {
                Ok(()) => {
                    handle.breaker.on_success();
                    self.metrics.record_delivery(started.elapsed().as_millis() as u64);
                    record.last_error = None;
                    self.persist(record, DispatchStatus::Delivered).await;
                    info!(
                        event = %record.event_ref,
                        sink = %record.sink_name,
                        attempts = %record.attempt_count,
                        "dispatch_delivered"
                    );
                    return DispatchOutcome::Delivered { attempts: record.attempt_count };
                }
                Err(e) => {
                    handle.breaker.on_failure();
                    self.metrics.record_delivery_failure();
                    let reason = e.reason().to_string();
                    if !e.is_retriable() || record.attempt_count >= handle.retry.max_attempts() {
                        return self.abandon(event, record, reason).await;
                    }

                    record.last_error = Some(reason);
                    let status = if record.last_status == DispatchStatus::Pending {
                        DispatchStatus::Failed
                    } else {
                        DispatchStatus::Retrying
                    };
                    self.persist(record, status).await;

                    let delay = handle.retry.delay_for(record.attempt_count);
                    warn!(
                        event = %record.event_ref,
                        sink = %record.sink_name,
                        attempt = %record.attempt_count,
                        delay_ms = %delay.as_millis(),
                        error = %e,
                        "dispatch_attempt_failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_for_stop(&mut force_stop) => return self.interrupt(record).await,
                    }
                    if record.last_status == DispatchStatus::Failed {
                        self.persist(record, DispatchStatus::Retrying).await;
                    }
                }
            }
        }
    }

    async fn abandon(&self, event: &ScanEvent, record: &mut DispatchRecord, reason: String) -> DispatchOutcome {
        record.last_error = Some(reason.clone());
        self.persist(record, DispatchStatus::Abandoned).await;
        self.metrics.record_abandoned();
        error!(
            event = %record.event_ref,
            sink = %record.sink_name,
            object_id = %event.object_id,
            attempts = %record.attempt_count,
            error = %reason,
            "dispatch_abandoned"
        );
        if let Some(egress) = &self.egress {
            egress.send_alert(AlertPayload::abandoned(event, &record.sink_name, record.attempt_count, Some(&reason)));
        }
        DispatchOutcome::Abandoned { attempts: record.attempt_count, reason }
    }

    async fn interrupt(&self, record: &mut DispatchRecord) -> DispatchOutcome {
        if record.attempt_count > 0 {
            self.persist(record, DispatchStatus::Retrying).await;
        }
        info!(
            event = %record.event_ref,
            sink = %record.sink_name,
            attempts = %record.attempt_count,
            status = %record.last_status,
            "dispatch_interrupted"
        );
        DispatchOutcome::Interrupted { attempts: record.attempt_count }
    }

    async fn persist(&self, record: &mut DispatchRecord, status: DispatchStatus) {
        if !record.last_status.can_advance_to(status) {
            warn!(
                event = %record.event_ref,
                sink = %record.sink_name,
                from = %record.last_status,
                to = %status,
                "dispatch_transition_rejected"
            );
            return;
        }
        record.last_status = status;
        record.updated_at = Utc::now();
        match self.audit.record_dispatch(record).await {
            Ok(true) => {}
            Ok(false) => debug!(event = %record.event_ref, sink = %record.sink_name, status = %status, "dispatch_status_unchanged"),
            Err(e) => error!(
                event = %record.event_ref,
                sink = %record.sink_name,
                status = %status,
                error = %e,
                "dispatch_status_persist_failed"
            ),
        }
    }
}

/// Resolves once the force-stop flag is raised; never if the sender is gone
async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
