//! Background audit maintenance
//!
//! On every tick: prune events past retention whose deliveries are all
//! terminal, generate yesterday's daily report if it is missing, then
//! check the last hour's abandoned deliveries against the alert threshold.
//! Runs as its own task on the shared pool; WAL mode keeps inserts flowing
//! while it works.

use crate::domain::error::AuditResult;
use crate::io::audit::AuditStore;
use chrono::{DateTime, Days, TimeDelta, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_ABANDONED_ALERT_PER_HOUR: u32 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pruned: u64,
    pub report_written: bool,
    /// Events observed in the hour before the pass
    pub recent_events: u64,
    /// Deliveries abandoned in the hour before the pass
    pub recent_abandoned: u64,
    pub alert_raised: bool,
}

pub struct Maintenance {
    audit: AuditStore,
    retention_days: u32,
    interval: Duration,
    abandoned_alert_per_hour: u32,
}

impl Maintenance {
    pub fn new(audit: AuditStore, retention_days: u32, interval: Duration) -> Self {
        Self { audit, retention_days, interval, abandoned_alert_per_hour: DEFAULT_ABANDONED_ALERT_PER_HOUR }
    }

    /// Alert when more deliveries than this were abandoned in the last hour; 0 disables
    pub fn with_abandoned_alert(mut self, per_hour: u32) -> Self {
        self.abandoned_alert_per_hour = per_hour;
        self
    }

    /// One maintenance pass as of `now`
    pub async fn run_once(&self, now: DateTime<Utc>) -> AuditResult<MaintenanceReport> {
        let pruned = self.audit.prune(self.retention_days, now).await?;
        if pruned > 0 {
            info!(pruned = %pruned, retention_days = %self.retention_days, "audit_pruned");
        }

        let mut report_written = false;
        if let Some(yesterday) = now.date_naive().checked_sub_days(Days::new(1)) {
            if !self.audit.has_daily_report(yesterday).await? {
                let report = self.audit.daily_report(yesterday).await?;
                info!(
                    date = %report.date,
                    events = %report.total_events,
                    objects = %report.unique_objects,
                    locations = %report.unique_locations,
                    delivered = %report.delivered,
                    abandoned = %report.abandoned,
                    "daily_report_generated"
                );
                report_written = true;
            }
        }

        let hour_ago = now - TimeDelta::hours(1);
        let recent_events = self.audit.events_since(hour_ago).await?;
        let recent_abandoned = self.audit.abandoned_dispatches(hour_ago).await?.len() as u64;
        let alert_raised =
            self.abandoned_alert_per_hour > 0 && recent_abandoned > u64::from(self.abandoned_alert_per_hour);
        if alert_raised {
            error!(
                abandoned = %recent_abandoned,
                threshold = %self.abandoned_alert_per_hour,
                window = "1h",
                "abandoned_rate_high"
            );
        }
        info!(recent_events = %recent_events, recent_abandoned = %recent_abandoned, "health_check_completed");

        Ok(MaintenanceReport { pruned, report_written, recent_events, recent_abandoned, alert_raised })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = %self.interval.as_secs(), retention_days = %self.retention_days, "maintenance_started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!(error = %e, "maintenance_failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("maintenance_shutdown");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DispatchRecord, DispatchStatus, ScanEvent};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn event(seq: u64, at: DateTime<Utc>) -> ScanEvent {
        ScanEvent {
            event_id: Uuid::now_v7(),
            scanner_id: "pi-dock".to_string(),
            sequence_no: seq,
            object_id: "OBJ001".to_string(),
            object_name: "Projector".to_string(),
            category: "equipment".to_string(),
            location_id: "LOC001".to_string(),
            location_name: "Storage".to_string(),
            observed_at: at,
        }
    }

    #[tokio::test]
    async fn test_run_once_prunes_and_reports_yesterday_once() {
        let audit = AuditStore::in_memory().await.unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 1, 0, 0).unwrap();
        audit.record(&event(1, Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap())).await.unwrap();
        audit.record(&event(2, Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap())).await.unwrap();

        let maintenance = Maintenance::new(audit.clone(), 30, Duration::from_secs(3600));
        let first = maintenance.run_once(now).await.unwrap();
        assert_eq!(first.pruned, 1);
        assert!(first.report_written);
        assert_eq!(audit.event_count().await.unwrap(), 1);

        let second = maintenance.run_once(now).await.unwrap();
        assert_eq!(second.pruned, 0);
        assert!(!second.report_written);
        assert!(!second.alert_raised);
    }

    async fn abandon(audit: &AuditStore, ev: &ScanEvent, at: DateTime<Utc>) {
        let mut record = DispatchRecord::pending(ev.event_ref(), "crm", false);
        audit.record_routed(ev, std::slice::from_ref(&record)).await.unwrap();
        record.attempt_count = 3;
        record.last_status = DispatchStatus::Abandoned;
        record.last_error = Some("HTTP 503".to_string());
        record.updated_at = at;
        audit.record_dispatch(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_rate_above_threshold_raises_alert() {
        let audit = AuditStore::in_memory().await.unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let recent = now - TimeDelta::minutes(10);
        for seq in 1..=6 {
            abandon(&audit, &event(seq, recent), recent).await;
        }
        // outside the hour
        let earlier = now - TimeDelta::hours(3);
        abandon(&audit, &event(7, earlier), earlier).await;

        let maintenance = Maintenance::new(audit.clone(), 30, Duration::from_secs(3600));
        let report = maintenance.run_once(now).await.unwrap();
        assert_eq!(report.recent_events, 6);
        assert_eq!(report.recent_abandoned, 6);
        assert!(report.alert_raised);

        let lenient = Maintenance::new(audit, 30, Duration::from_secs(3600)).with_abandoned_alert(6);
        assert!(!lenient.run_once(now).await.unwrap().alert_raised);
    }

    #[tokio::test]
    async fn test_zero_threshold_disables_alert() {
        let audit = AuditStore::in_memory().await.unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        for seq in 1..=10 {
            abandon(&audit, &event(seq, now), now).await;
        }

        let maintenance = Maintenance::new(audit, 30, Duration::from_secs(3600)).with_abandoned_alert(0);
        let report = maintenance.run_once(now).await.unwrap();
        assert_eq!(report.recent_abandoned, 10);
        assert!(!report.alert_raised);
    }
}
