//! Event consumer - persist, route, acknowledge, dispatch
//!
//! Per inbound message:
//! 1. decode the scan event (undecodable payloads are logged, counted and acked)
//! 2. evaluate the rules
//! 3. record the event and its pending dispatch rows in one transaction
//! 4. acknowledge to the transport
//! 5. dispatch in the background, bounded by the in-flight window
//!
//! A failed write leaves the message unacknowledged so the transport
//! redelivers it. Duplicates are acked and not dispatched again; their
//! unfinished rows are resumed on the next start.
//!
//! Shutdown stops pulling, waits for in-flight dispatches up to the grace
//! period, then raises the force-stop flag so the rest persist as resumable.

use crate::domain::types::{DispatchRecord, ScanEvent};
use crate::infra::metrics::Metrics;
use crate::io::audit::{AuditStore, RecordOutcome};
use crate::io::transport::InboundMessage;
use crate::services::dispatcher::{Dispatcher, SinkOutcome};
use crate::services::rules::{RouteTarget, RuleEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How long force-stopped deliveries get to persist their status
const FORCE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub recorded: u64,
    pub duplicates: u64,
    pub decode_failures: u64,
    /// Messages left unacknowledged after a failed write
    pub unacked: u64,
    pub resumed: u64,
    /// Recorded events whose dispatch was left to the next start's resume
    pub deferred: u64,
}

pub struct Consumer {
    audit: AuditStore,
    rules: Arc<RuleEngine>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    permits: Arc<Semaphore>,
    grace: Duration,
    force_stop: watch::Sender<bool>,
    /// Set by `run`; lets a wait for the in-flight window give way to shutdown
    shutdown: Option<watch::Receiver<bool>>,
    tasks: JoinSet<Vec<SinkOutcome>>,
    stats: ConsumerStats,
}

impl Consumer {
    /// `force_stop` must be the sender paired with the dispatcher's receiver
    pub fn new(
        audit: AuditStore,
        rules: Arc<RuleEngine>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<Metrics>,
        max_in_flight: usize,
        grace: Duration,
        force_stop: watch::Sender<bool>,
    ) -> Self {
        Self {
            audit,
            rules,
            dispatcher,
            metrics,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            grace,
            force_stop,
            shutdown: None,
            tasks: JoinSet::new(),
            stats: ConsumerStats::default(),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Resume, consume until shutdown or end of input, then drain
    pub async fn run(mut self, mut rx: mpsc::Receiver<InboundMessage>, mut shutdown: watch::Receiver<bool>) -> ConsumerStats {
        self.shutdown = Some(shutdown.clone());
        if let Err(e) = self.resume().await {
            error!(error = %e, "dispatch_resume_failed");
        }
        info!(max_in_flight = %self.permits.available_permits(), "consumer_started");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("consumer_shutdown_requested");
                        break;
                    }
                }
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg).await,
                        None => {
                            info!("consumer_input_closed");
                            break;
                        }
                    }
                }
            }
            self.reap();
        }

        // stop pulling
        drop(rx);
        self.drain().await;
        info!(
            received = %self.stats.received,
            recorded = %self.stats.recorded,
            duplicates = %self.stats.duplicates,
            decode_failures = %self.stats.decode_failures,
            unacked = %self.stats.unacked,
            resumed = %self.stats.resumed,
            deferred = %self.stats.deferred,
            "consumer_stopped"
        );
        self.stats
    }

    /// Process one inbound message up to acknowledgement and spawn its dispatch
    pub async fn handle(&mut self, msg: InboundMessage) {
        self.stats.received += 1;
        let (payload, received_at, ack) = msg.into_parts();

        let event: ScanEvent = match serde_json::from_slice(&payload) {
            Ok(event) => event,
            Err(e) => {
                self.stats.decode_failures += 1;
                self.metrics.record_decode_failure();
                warn!(error = %e, bytes = %payload.len(), "scan_decode_failed");
                // poison message: redelivery cannot fix it
                if let Err(e) = ack.ack().await {
                    warn!(error = %e, "transport_ack_failed");
                }
                return;
            }
        };

        let event_ref = event.event_ref();
        let routes = self.rules.evaluate(&event);
        let pending: Vec<DispatchRecord> = routes
            .iter()
            .map(|t| DispatchRecord::pending(event_ref.clone(), &t.sink, t.notify))
            .collect();

        let outcome = match self.audit.record_routed(&event, &pending).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.unacked += 1;
                error!(event = %event_ref, error = %e, "audit_record_failed");
                return;
            }
        };

        if let Err(e) = ack.ack().await {
            // already persisted; a redelivery will be a duplicate
            warn!(event = %event_ref, error = %e, "transport_ack_failed");
        }
        self.metrics.record_event_consumed(received_at.elapsed().as_micros() as u64);

        match outcome {
            RecordOutcome::Duplicate => {
                self.stats.duplicates += 1;
                self.metrics.record_duplicate_event();
                info!(event = %event_ref, "duplicate_event");
            }
            RecordOutcome::Inserted { previous_location } => {
                self.stats.recorded += 1;
                debug!(
                    event = %event_ref,
                    object_id = %event.object_id,
                    location_id = %event.location_id,
                    sinks = %routes.len(),
                    "event_recorded"
                );
                if routes.is_empty() {
                    debug!(event = %event_ref, "no_rule_matched");
                    return;
                }
                self.spawn_dispatch(Arc::new(event), routes.into_vec(), previous_location).await;
            }
        }
    }

    /// Re-dispatch every non-terminal delivery left by a previous run
    pub async fn resume(&mut self) -> crate::domain::error::AuditResult<u64> {
        let rows = self.audit.resumable_dispatches().await?;
        let mut batches: Vec<(ScanEvent, Vec<RouteTarget>)> = Vec::new();
        for (event, record) in rows {
            let target = RouteTarget { sink: record.sink_name, notify: record.notify };
            match batches.last_mut() {
                Some((last, targets)) if last.event_ref() == record.event_ref => targets.push(target),
                _ => batches.push((event, vec![target])),
            }
        }

        let events = batches.len() as u64;
        for (event, targets) in batches {
            self.stats.resumed += targets.len() as u64;
            self.spawn_dispatch(Arc::new(event), targets, None).await;
        }
        if events > 0 {
            info!(events = %events, deliveries = %self.stats.resumed, "dispatch_resumed");
        }
        Ok(events)
    }

    async fn spawn_dispatch(&mut self, event: Arc<ScanEvent>, targets: Vec<RouteTarget>, previous: Option<String>) {
        // waits while the in-flight window is full; the pending rows are
        // already persisted, so shutdown leaves them to the next resume
        let mut shutdown = self.shutdown.clone();
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = wait_for_shutdown(&mut shutdown) => {
                self.stats.deferred += 1;
                info!(event = %event.event_ref(), sinks = %targets.len(), "dispatch_deferred_to_resume");
                return;
            }
        };
        let dispatcher = self.dispatcher.clone();
        self.tasks.spawn(async move {
            let outcomes = dispatcher.dispatch(event, &targets, previous).await;
            drop(permit);
            outcomes
        });
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "dispatch_task_failed");
            }
        }
    }

    async fn drain(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        info!(in_flight = %self.tasks.len(), grace_ms = %self.grace.as_millis(), "consumer_draining");

        let deadline = tokio::time::sleep(self.grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = self.tasks.join_next() => match joined {
                    Some(Err(e)) => error!(error = %e, "dispatch_task_failed"),
                    Some(Ok(_)) => {}
                    None => return,
                },
                _ = &mut deadline => break,
            }
        }

        warn!(remaining = %self.tasks.len(), "dispatch_grace_expired");
        let _ = self.force_stop.send(true);
        let forced = tokio::time::timeout(FORCE_STOP_TIMEOUT, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if forced.is_err() {
            error!(remaining = %self.tasks.len(), "dispatch_force_stop_timeout");
            self.tasks.abort_all();
        }
    }
}

/// Resolves once shutdown is signalled; never without a receiver
async fn wait_for_shutdown(rx: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = rx {
        if rx.wait_for(|stop| *stop).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}
