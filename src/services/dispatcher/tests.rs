use super::*;
use crate::domain::types::{EventRef, ScanEvent};
use crate::io::egress_channel::{create_egress_channel, EgressMessage};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

/// Sink that replays scripted results, then repeats its fallback
struct ScriptedSink {
    name: String,
    calls: AtomicU32,
    script: Mutex<VecDeque<Result<(), SinkError>>>,
    fallback: Mutex<Result<(), SinkError>>,
    delay: Option<Duration>,
}

impl ScriptedSink {
    fn new(name: &str, fallback: Result<(), SinkError>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicU32::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            delay: None,
        })
    }

    fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicU32::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(())),
            delay: Some(delay),
        })
    }

    fn scripted(name: &str, script: Vec<Result<(), SinkError>>, fallback: Result<(), SinkError>) -> Arc<Self> {
        let sink = Self::new(name, fallback);
        *sink.script.lock() = script.into();
        sink
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_fallback(&self, result: Result<(), SinkError>) {
        *self.fallback.lock() = result;
    }
}

#[async_trait]
impl Sink for ScriptedSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, _event: &ScanEvent) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

fn retriable() -> Result<(), SinkError> {
    Err(SinkError::Retriable("HTTP 503".to_string()))
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig { max_attempts, base_delay_ms: 1, max_delay_ms: 5, jitter_ms: 0 }
}

fn lenient_breaker() -> BreakerConfig {
    BreakerConfig { failure_threshold: 100, cooldown_ms: 60_000 }
}

fn event(seq: u64) -> Arc<ScanEvent> {
    Arc::new(ScanEvent {
        event_id: Uuid::now_v7(),
        scanner_id: "pi-dock".to_string(),
        sequence_no: seq,
        object_id: "OBJ002".to_string(),
        object_name: "Laptop".to_string(),
        category: "personal".to_string(),
        location_id: "LOC002".to_string(),
        location_name: "Server Room".to_string(),
        observed_at: Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, seq as u32 % 60).unwrap(),
    })
}

fn target(sink: &str, notify: bool) -> RouteTarget {
    RouteTarget { sink: sink.to_string(), notify }
}

struct Harness {
    dispatcher: Dispatcher,
    metrics: Arc<Metrics>,
    stop_tx: watch::Sender<bool>,
}

async fn harness() -> Harness {
    let audit = AuditStore::in_memory().await.unwrap();
    let metrics = Arc::new(Metrics::new());
    let (stop_tx, stop_rx) = watch::channel(false);
    let dispatcher = Dispatcher::new(audit, metrics.clone(), stop_rx);
    Harness { dispatcher, metrics, stop_tx }
}

impl Harness {
    fn add(&mut self, sink: Arc<ScriptedSink>, retry: RetryConfig, breaker: BreakerConfig, timeout: Duration) {
        self.dispatcher.add_sink(SinkHandle::new(sink, retry, breaker, timeout));
    }

    async fn record(&self, event: &ScanEvent, targets: &[RouteTarget]) {
        self.dispatcher.audit().record(event).await.unwrap();
        let pending: Vec<DispatchRecord> = targets
            .iter()
            .map(|t| DispatchRecord::pending(event.event_ref(), &t.sink, t.notify))
            .collect();
        self.dispatcher.audit().insert_pending(&pending).await.unwrap();
    }

    async fn status(&self, event_ref: &EventRef, sink: &str) -> DispatchRecord {
        self.dispatcher.audit().dispatch_status(event_ref, sink).await.unwrap().unwrap()
    }
}

fn outcome_for<'a>(outcomes: &'a [SinkOutcome], sink: &str) -> &'a DispatchOutcome {
    &outcomes.iter().find(|o| o.sink == sink).unwrap().outcome
}

#[tokio::test]
async fn test_always_retriable_sink_is_tried_max_attempts_then_abandoned() {
    let mut h = harness().await;
    let sink = ScriptedSink::new("crm", retriable());
    h.add(sink.clone(), fast_retry(3), lenient_breaker(), Duration::from_secs(1));
    let dispatcher = Arc::new(h.dispatcher);

    let ev = event(1);
    let targets = [target("crm", false)];
    dispatcher.audit().record(&ev).await.unwrap();
    let outcomes = dispatcher.dispatch(ev.clone(), &targets, None).await;

    assert_eq!(sink.calls(), 3);
    assert!(matches!(outcome_for(&outcomes, "crm"), DispatchOutcome::Abandoned { attempts: 3, .. }));

    let record = dispatcher.audit().dispatch_status(&ev.event_ref(), "crm").await.unwrap().unwrap();
    assert_eq!(record.last_status, DispatchStatus::Abandoned);
    assert_eq!(record.attempt_count, 3);
    assert_eq!(record.last_error.as_deref(), Some("HTTP 503"));
    assert_eq!(h.metrics.abandoned_total(), 1);
    assert_eq!(h.metrics.dispatch_in_flight(), 0);
}

#[tokio::test]
async fn test_recovers_after_transient_failures() {
    let mut h = harness().await;
    let sink = ScriptedSink::scripted("index", vec![retriable(), retriable()], Ok(()));
    h.add(sink.clone(), fast_retry(5), lenient_breaker(), Duration::from_secs(1));

    let ev = event(2);
    let targets = [target("index", false)];
    h.record(&ev, &targets).await;
    let dispatcher = Arc::new(h.dispatcher);
    let outcomes = dispatcher.dispatch(ev.clone(), &targets, None).await;

    assert_eq!(outcome_for(&outcomes, "index"), &DispatchOutcome::Delivered { attempts: 3 });
    let record = dispatcher.audit().dispatch_status(&ev.event_ref(), "index").await.unwrap().unwrap();
    assert_eq!(record.last_status, DispatchStatus::Delivered);
    assert_eq!(record.attempt_count, 3);
    assert_eq!(record.last_error, None);
    assert_eq!(h.metrics.deliveries_total(), 1);
}

#[tokio::test]
async fn test_permanent_failure_abandons_immediately() {
    let mut h = harness().await;
    let sink = ScriptedSink::new("crm", Err(SinkError::Permanent("HTTP 400".to_string())));
    h.add(sink.clone(), fast_retry(5), lenient_breaker(), Duration::from_secs(1));

    let ev = event(3);
    let targets = [target("crm", false)];
    h.record(&ev, &targets).await;
    let dispatcher = Arc::new(h.dispatcher);
    let outcomes = dispatcher.dispatch(ev.clone(), &targets, None).await;

    assert_eq!(sink.calls(), 1);
    assert_eq!(
        outcome_for(&outcomes, "crm"),
        &DispatchOutcome::Abandoned { attempts: 1, reason: "HTTP 400".to_string() }
    );
}

#[tokio::test]
async fn test_terminal_records_are_not_redelivered() {
    let mut h = harness().await;
    let sink = ScriptedSink::new("audit", Ok(()));
    h.add(sink.clone(), fast_retry(3), lenient_breaker(), Duration::from_secs(1));

    let ev = event(4);
    let targets = [target("audit", false)];
    h.record(&ev, &targets).await;
    let dispatcher = Arc::new(h.dispatcher);

    dispatcher.dispatch(ev.clone(), &targets, None).await;
    let second = dispatcher.dispatch(ev.clone(), &targets, None).await;

    assert_eq!(sink.calls(), 1);
    assert_eq!(outcome_for(&second, "audit"), &DispatchOutcome::Skipped(DispatchStatus::Delivered));
}

#[tokio::test]
async fn test_failing_sink_does_not_affect_other_sinks() {
    let mut h = harness().await;
    let good = ScriptedSink::new("index", Ok(()));
    let bad = ScriptedSink::new("crm", retriable());
    h.add(good.clone(), fast_retry(3), lenient_breaker(), Duration::from_secs(1));
    h.add(bad.clone(), fast_retry(3), lenient_breaker(), Duration::from_secs(1));

    let ev = event(5);
    let targets = [target("index", false), target("crm", false)];
    h.record(&ev, &targets).await;
    let dispatcher = Arc::new(h.dispatcher);
    let outcomes = dispatcher.dispatch(ev.clone(), &targets, None).await;

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcome_for(&outcomes, "index"), &DispatchOutcome::Delivered { attempts: 1 });
    assert!(matches!(outcome_for(&outcomes, "crm"), DispatchOutcome::Abandoned { .. }));
    assert_eq!(good.calls(), 1);
    assert_eq!(bad.calls(), 3);
}

#[tokio::test]
async fn test_sink_timeout_counts_as_retriable() {
    let mut h = harness().await;
    let sink = ScriptedSink::slow("slow", Duration::from_secs(30));
    h.add(sink.clone(), fast_retry(2), lenient_breaker(), Duration::from_millis(20));

    let ev = event(6);
    let targets = [target("slow", false)];
    h.record(&ev, &targets).await;
    let dispatcher = Arc::new(h.dispatcher);
    let outcomes = dispatcher.dispatch(ev.clone(), &targets, None).await;

    assert_eq!(sink.calls(), 2);
    match outcome_for(&outcomes, "slow") {
        DispatchOutcome::Abandoned { attempts, reason } => {
            assert_eq!(*attempts, 2);
            assert!(reason.contains("timed out"), "{reason}");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn test_open_breaker_short_circuits_then_half_open_trial_closes_it() {
    let mut h = harness().await;
    let sink = ScriptedSink::new("crm", retriable());
    h.add(
        sink.clone(),
        fast_retry(1),
        BreakerConfig { failure_threshold: 2, cooldown_ms: 100 },
        Duration::from_secs(1),
    );
    let dispatcher = Arc::new(h.dispatcher);
    let targets = [target("crm", false)];

    for seq in 10..12 {
        let ev = event(seq);
        dispatcher.audit().record(&ev).await.unwrap();
        dispatcher.dispatch(ev, &targets, None).await;
    }
    assert_eq!(sink.calls(), 2);
    assert!(matches!(dispatcher.sink("crm").unwrap().breaker().state(), BreakerState::Open { .. }));
    assert_eq!(h.metrics.open_breakers(), 1);

    // open: abandoned without calling the sink
    let ev = event(12);
    dispatcher.audit().record(&ev).await.unwrap();
    let outcomes = dispatcher.dispatch(ev.clone(), &targets, None).await;
    assert_eq!(sink.calls(), 2);
    assert_eq!(
        outcome_for(&outcomes, "crm"),
        &DispatchOutcome::Abandoned { attempts: 0, reason: "circuit open".to_string() }
    );
    assert_eq!(h.metrics.short_circuited_total(), 1);

    // after the cool-down a single trial goes through and closes the breaker
    tokio::time::sleep(Duration::from_millis(150)).await;
    sink.set_fallback(Ok(()));
    let ev = event(13);
    dispatcher.audit().record(&ev).await.unwrap();
    let outcomes = dispatcher.dispatch(ev, &targets, None).await;
    assert_eq!(outcome_for(&outcomes, "crm"), &DispatchOutcome::Delivered { attempts: 1 });
    assert_eq!(sink.calls(), 3);
    assert_eq!(dispatcher.sink("crm").unwrap().breaker().state(), BreakerState::Closed);
    assert_eq!(h.metrics.open_breakers(), 0);
}

#[tokio::test]
async fn test_force_stop_persists_resumable_status() {
    let mut h = harness().await;
    let sink = ScriptedSink::new("crm", retriable());
    h.add(
        sink.clone(),
        RetryConfig { max_attempts: 5, base_delay_ms: 60_000, max_delay_ms: 60_000, jitter_ms: 0 },
        lenient_breaker(),
        Duration::from_secs(1),
    );

    let ev = event(20);
    let targets = [target("crm", false)];
    h.record(&ev, &targets).await;
    let stop_tx = h.stop_tx;
    let dispatcher = Arc::new(h.dispatcher);

    let task = {
        let dispatcher = dispatcher.clone();
        let ev = ev.clone();
        tokio::spawn(async move { dispatcher.dispatch(ev, &[target("crm", false)], None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop_tx.send(true).unwrap();

    let outcomes = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert_eq!(outcome_for(&outcomes, "crm"), &DispatchOutcome::Interrupted { attempts: 1 });

    let record = dispatcher.audit().dispatch_status(&ev.event_ref(), "crm").await.unwrap().unwrap();
    assert_eq!(record.last_status, DispatchStatus::Retrying);
    assert_eq!(record.attempt_count, 1);

    let resumable = dispatcher.audit().resumable_dispatches().await.unwrap();
    assert_eq!(resumable.len(), 1);
}

#[tokio::test]
async fn test_force_stop_during_first_call_records_the_attempt() {
    let mut h = harness().await;
    let sink = ScriptedSink::slow("crm", Duration::from_secs(60));
    h.add(sink.clone(), fast_retry(3), lenient_breaker(), Duration::from_secs(120));

    let ev = event(22);
    h.record(&ev, &[target("crm", false)]).await;
    let stop_tx = h.stop_tx;
    let dispatcher = Arc::new(h.dispatcher);

    let task = {
        let dispatcher = dispatcher.clone();
        let ev = ev.clone();
        tokio::spawn(async move { dispatcher.dispatch(ev, &[target("crm", false)], None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.calls(), 1);
    stop_tx.send(true).unwrap();

    let outcomes = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert_eq!(outcome_for(&outcomes, "crm"), &DispatchOutcome::Interrupted { attempts: 1 });

    let record = dispatcher.audit().dispatch_status(&ev.event_ref(), "crm").await.unwrap().unwrap();
    assert_eq!(record.last_status, DispatchStatus::Retrying);
    assert_eq!(record.attempt_count, 1);
}

#[tokio::test]
async fn test_failed_row_left_by_crash_resumes_through_retrying() {
    let mut h = harness().await;
    let sink = ScriptedSink::new("crm", Ok(()));
    h.add(sink.clone(), fast_retry(3), lenient_breaker(), Duration::from_secs(1));

    let ev = event(23);
    h.record(&ev, &[target("crm", false)]).await;
    let mut prior = DispatchRecord::pending(ev.event_ref(), "crm", false);
    prior.attempt_count = 1;
    prior.last_status = DispatchStatus::Failed;
    h.dispatcher.audit().record_dispatch(&prior).await.unwrap();

    let outcome = h.dispatcher.deliver(&ev, &target("crm", false)).await;
    assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 2 });
    assert_eq!(h.status(&ev.event_ref(), "crm").await.last_status, DispatchStatus::Delivered);
}

#[tokio::test]
async fn test_resumed_delivery_continues_from_persisted_attempts() {
    let mut h = harness().await;
    let sink = ScriptedSink::new("crm", retriable());
    h.add(sink.clone(), fast_retry(3), lenient_breaker(), Duration::from_secs(1));

    let ev = event(21);
    h.record(&ev, &[target("crm", false)]).await;
    let mut prior = DispatchRecord::pending(ev.event_ref(), "crm", false);
    prior.attempt_count = 2;
    prior.last_status = DispatchStatus::Retrying;
    h.dispatcher.audit().record_dispatch(&prior).await.unwrap();

    let outcome = h.dispatcher.deliver(&ev, &target("crm", false)).await;
    assert_eq!(sink.calls(), 1);
    assert!(matches!(outcome, DispatchOutcome::Abandoned { attempts: 3, .. }));
    assert_eq!(h.status(&ev.event_ref(), "crm").await.last_status, DispatchStatus::Abandoned);
}

#[tokio::test]
async fn test_notify_delivery_publishes_location_update_and_abandon_alerts() {
    let mut h = harness().await;
    h.add(ScriptedSink::new("index", Ok(())), fast_retry(1), lenient_breaker(), Duration::from_secs(1));
    h.add(ScriptedSink::new("crm", retriable()), fast_retry(1), lenient_breaker(), Duration::from_secs(1));
    let (egress, mut rx) = create_egress_channel(16, "hq".to_string());
    let dispatcher = Arc::new(h.dispatcher.with_egress(egress));

    let ev = event(30);
    dispatcher.audit().record(&ev).await.unwrap();
    let targets = [target("index", true), target("crm", false)];
    dispatcher.dispatch(ev.clone(), &targets, Some("LOC001".to_string())).await;

    let mut updates = Vec::new();
    let mut alerts = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        match msg {
            EgressMessage::LocationUpdate(update) => updates.push(update),
            EgressMessage::Alert(alert) => alerts.push(alert),
            EgressMessage::Scan(_) => panic!("dispatcher never publishes scans"),
        }
    }

    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].object_id, "OBJ002");
    assert_eq!(updates[0].previous_location_id.as_deref(), Some("LOC001"));
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].sink, "crm");
}

#[tokio::test]
async fn test_no_location_update_without_notify_target() {
    let mut h = harness().await;
    h.add(ScriptedSink::new("index", Ok(())), fast_retry(1), lenient_breaker(), Duration::from_secs(1));
    let (egress, mut rx) = create_egress_channel(16, "hq".to_string());
    let dispatcher = Arc::new(h.dispatcher.with_egress(egress));

    let ev = event(31);
    dispatcher.audit().record(&ev).await.unwrap();
    dispatcher.dispatch(ev, &[target("index", false)], None).await;
    assert!(rx.try_recv().is_err());
}
