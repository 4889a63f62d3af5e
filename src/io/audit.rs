//! Audit store - durable, idempotent record of scan events and deliveries
//!
//! SQLite (WAL) via sqlx. Timestamps are stored as epoch milliseconds.
//!
//! Tables:
//! - `scan_events` keyed on `(scanner_id, sequence_no)`; inserts are upserts
//!   so a redelivered event never produces a second row
//! - `dispatch_records` keyed on `(scanner_id, sequence_no, sink)`; status
//!   only moves forward, enforced by `status_rank` in the upsert
//! - `current_positions` last known location per object (last-write-wins)
//! - `daily_stats` stored daily reports

use crate::domain::error::{AuditError, AuditResult};
use crate::domain::types::{DispatchRecord, DispatchStatus, EventRef, ScanEvent};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS scan_events (
        scanner_id TEXT NOT NULL,
        sequence_no INTEGER NOT NULL,
        event_id TEXT NOT NULL,
        object_id TEXT NOT NULL,
        object_name TEXT NOT NULL,
        category TEXT NOT NULL,
        location_id TEXT NOT NULL,
        location_name TEXT NOT NULL,
        observed_at INTEGER NOT NULL,
        recorded_at INTEGER NOT NULL,
        PRIMARY KEY (scanner_id, sequence_no)
    )",
    "CREATE INDEX IF NOT EXISTS idx_scan_events_object ON scan_events (object_id, observed_at)",
    "CREATE INDEX IF NOT EXISTS idx_scan_events_location ON scan_events (location_id, observed_at)",
    "CREATE INDEX IF NOT EXISTS idx_scan_events_observed ON scan_events (observed_at)",
    "CREATE TABLE IF NOT EXISTS dispatch_records (
        scanner_id TEXT NOT NULL,
        sequence_no INTEGER NOT NULL,
        sink TEXT NOT NULL,
        notify INTEGER NOT NULL DEFAULT 0,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        status_rank INTEGER NOT NULL,
        last_error TEXT,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (scanner_id, sequence_no, sink)
    )",
    "CREATE INDEX IF NOT EXISTS idx_dispatch_status ON dispatch_records (status_rank, updated_at)",
    "CREATE TABLE IF NOT EXISTS current_positions (
        object_id TEXT PRIMARY KEY,
        object_name TEXT NOT NULL,
        category TEXT NOT NULL,
        location_id TEXT NOT NULL,
        location_name TEXT NOT NULL,
        scanner_id TEXT NOT NULL,
        first_seen INTEGER NOT NULL,
        last_seen INTEGER NOT NULL,
        total_moves INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_positions_location ON current_positions (location_id)",
    "CREATE TABLE IF NOT EXISTS daily_stats (
        date TEXT PRIMARY KEY,
        total_events INTEGER NOT NULL,
        unique_objects INTEGER NOT NULL,
        unique_locations INTEGER NOT NULL,
        delivered INTEGER NOT NULL,
        abandoned INTEGER NOT NULL,
        report TEXT NOT NULL,
        generated_at INTEGER NOT NULL
    )",
];

const EVENT_COLUMNS: &str = "scanner_id, sequence_no, event_id, object_id, object_name, category, \
                             location_id, location_name, observed_at";

const DISPATCH_COLUMNS: &str =
    "scanner_id, sequence_no, sink, notify, attempt_count, status, last_error, updated_at";

/// Result of recording a scan event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First time this `(scanner_id, sequence_no)` was seen
    Inserted { previous_location: Option<String> },
    /// Redelivery of an already audited event
    Duplicate,
}

/// Filters for `AuditStore::query`; all optional, combined with AND
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub object_id: Option<String>,
    pub location_id: Option<String>,
    pub scanner_id: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentPosition {
    pub object_id: String,
    pub object_name: String,
    pub category: String,
    pub location_id: String,
    pub location_name: String,
    pub scanner_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_moves: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountEntry {
    pub id: String,
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyReport {
    pub date: NaiveDate,
    pub total_events: u64,
    pub unique_objects: u64,
    pub unique_locations: u64,
    pub delivered: u64,
    pub abandoned: u64,
    pub most_active_locations: Vec<CountEntry>,
    pub most_moved_objects: Vec<CountEntry>,
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> AuditResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| AuditError::Corrupt(format!("timestamp {ms}")))
}

fn event_from_row(row: &SqliteRow) -> AuditResult<ScanEvent> {
    let event_id: String = row.try_get("event_id")?;
    Ok(ScanEvent {
        event_id: Uuid::parse_str(&event_id).map_err(|e| AuditError::Corrupt(e.to_string()))?,
        scanner_id: row.try_get("scanner_id")?,
        sequence_no: row.try_get::<i64, _>("sequence_no")? as u64,
        object_id: row.try_get("object_id")?,
        object_name: row.try_get("object_name")?,
        category: row.try_get("category")?,
        location_id: row.try_get("location_id")?,
        location_name: row.try_get("location_name")?,
        observed_at: from_ms(row.try_get("observed_at")?)?,
    })
}

fn dispatch_from_row(row: &SqliteRow) -> AuditResult<DispatchRecord> {
    let status: String = row.try_get("status")?;
    Ok(DispatchRecord {
        event_ref: EventRef {
            scanner_id: row.try_get("scanner_id")?,
            sequence_no: row.try_get::<i64, _>("sequence_no")? as u64,
        },
        sink_name: row.try_get("sink")?,
        notify: row.try_get::<i64, _>("notify")? != 0,
        attempt_count: row.try_get::<i64, _>("attempt_count")? as u32,
        last_status: DispatchStatus::from_str(&status).map_err(AuditError::Corrupt)?,
        last_error: row.try_get("last_error")?,
        updated_at: from_ms(row.try_get("updated_at")?)?,
    })
}

fn position_from_row(row: &SqliteRow) -> AuditResult<CurrentPosition> {
    Ok(CurrentPosition {
        object_id: row.try_get("object_id")?,
        object_name: row.try_get("object_name")?,
        category: row.try_get("category")?,
        location_id: row.try_get("location_id")?,
        location_name: row.try_get("location_name")?,
        scanner_id: row.try_get("scanner_id")?,
        first_seen: from_ms(row.try_get("first_seen")?)?,
        last_seen: from_ms(row.try_get("last_seen")?)?,
        total_moves: row.try_get::<i64, _>("total_moves")? as u64,
    })
}

async fn insert_pending_rows(conn: &mut SqliteConnection, records: &[DispatchRecord]) -> AuditResult<()> {
    for record in records {
        sqlx::query(
            "INSERT INTO dispatch_records (scanner_id, sequence_no, sink, notify, attempt_count,
                                           status, status_rank, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, NULL, ?7)
             ON CONFLICT (scanner_id, sequence_no, sink) DO NOTHING",
        )
        .bind(&record.event_ref.scanner_id)
        .bind(record.event_ref.sequence_no as i64)
        .bind(&record.sink_name)
        .bind(record.notify as i64)
        .bind(DispatchStatus::Pending.as_str())
        .bind(DispatchStatus::Pending.rank())
        .bind(to_ms(record.updated_at))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Cloneable handle to the audit database
#[derive(Clone)]
pub struct AuditStore {
    pool: SqlitePool,
}

impl AuditStore {
    /// Open (creating if missing) a file-backed store in WAL mode
    pub async fn open(path: &str) -> AuditResult<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %path, "audit_store_opened");
        Ok(store)
    }

    /// Private in-memory store; a single pinned connection keeps the data alive
    pub async fn in_memory() -> AuditResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> AuditResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Idempotently record an event and advance the object's current position
    pub async fn record(&self, event: &ScanEvent) -> AuditResult<RecordOutcome> {
        self.record_routed(event, &[]).await
    }

    /// Record an event together with its pending dispatch rows in one transaction
    ///
    /// A duplicate leaves both the event and its dispatch rows untouched.
    pub async fn record_routed(&self, event: &ScanEvent, pending: &[DispatchRecord]) -> AuditResult<RecordOutcome> {
        let now = to_ms(Utc::now());
        let observed = to_ms(event.observed_at);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO scan_events (scanner_id, sequence_no, event_id, object_id, object_name, category,
                                      location_id, location_name, observed_at, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (scanner_id, sequence_no) DO NOTHING",
        )
        .bind(&event.scanner_id)
        .bind(event.sequence_no as i64)
        .bind(event.event_id.to_string())
        .bind(&event.object_id)
        .bind(&event.object_name)
        .bind(&event.category)
        .bind(&event.location_id)
        .bind(&event.location_name)
        .bind(observed)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            tx.rollback().await?;
            debug!(event = %event.event_ref(), "audit_duplicate_event");
            return Ok(RecordOutcome::Duplicate);
        }

        let previous_location: Option<String> =
            sqlx::query_scalar("SELECT location_id FROM current_positions WHERE object_id = ?1")
                .bind(&event.object_id)
                .fetch_optional(&mut *tx)
                .await?;

        // older events (sink-side reordering, resumed backlog) never overwrite a newer position
        sqlx::query(
            "INSERT INTO current_positions (object_id, object_name, category, location_id, location_name,
                                            scanner_id, first_seen, last_seen, total_moves)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 0)
             ON CONFLICT (object_id) DO UPDATE SET
                total_moves = current_positions.total_moves
                    + CASE WHEN current_positions.location_id != excluded.location_id THEN 1 ELSE 0 END,
                object_name = excluded.object_name,
                category = excluded.category,
                location_id = excluded.location_id,
                location_name = excluded.location_name,
                scanner_id = excluded.scanner_id,
                last_seen = excluded.last_seen
             WHERE excluded.last_seen >= current_positions.last_seen",
        )
        .bind(&event.object_id)
        .bind(&event.object_name)
        .bind(&event.category)
        .bind(&event.location_id)
        .bind(&event.location_name)
        .bind(&event.scanner_id)
        .bind(observed)
        .execute(&mut *tx)
        .await?;

        insert_pending_rows(&mut tx, pending).await?;
        tx.commit().await?;
        Ok(RecordOutcome::Inserted { previous_location })
    }

    /// Insert pending rows for new (event, sink) pairs; existing rows are kept
    pub async fn insert_pending(&self, records: &[DispatchRecord]) -> AuditResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        insert_pending_rows(&mut tx, records).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Persist a dispatch outcome; returns false if it would move status backwards
    pub async fn record_dispatch(&self, record: &DispatchRecord) -> AuditResult<bool> {
        let result = sqlx::query(
            "INSERT INTO dispatch_records (scanner_id, sequence_no, sink, notify, attempt_count,
                                           status, status_rank, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (scanner_id, sequence_no, sink) DO UPDATE SET
                notify = MAX(dispatch_records.notify, excluded.notify),
                attempt_count = MAX(dispatch_records.attempt_count, excluded.attempt_count),
                status = excluded.status,
                status_rank = excluded.status_rank,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
             WHERE dispatch_records.status_rank < 3
               AND dispatch_records.status_rank <= excluded.status_rank",
        )
        .bind(&record.event_ref.scanner_id)
        .bind(record.event_ref.sequence_no as i64)
        .bind(&record.sink_name)
        .bind(record.notify as i64)
        .bind(record.attempt_count as i64)
        .bind(record.last_status.as_str())
        .bind(record.last_status.rank())
        .bind(&record.last_error)
        .bind(to_ms(record.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn dispatch_status(&self, event_ref: &EventRef, sink: &str) -> AuditResult<Option<DispatchRecord>> {
        let sql = format!(
            "SELECT {DISPATCH_COLUMNS} FROM dispatch_records
             WHERE scanner_id = ?1 AND sequence_no = ?2 AND sink = ?3"
        );
        let row = sqlx::query(&sql)
            .bind(&event_ref.scanner_id)
            .bind(event_ref.sequence_no as i64)
            .bind(sink)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dispatch_from_row).transpose()
    }

    pub async fn dispatch_records(&self, event_ref: &EventRef) -> AuditResult<Vec<DispatchRecord>> {
        let sql = format!(
            "SELECT {DISPATCH_COLUMNS} FROM dispatch_records
             WHERE scanner_id = ?1 AND sequence_no = ?2 ORDER BY rowid"
        );
        let rows = sqlx::query(&sql)
            .bind(&event_ref.scanner_id)
            .bind(event_ref.sequence_no as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(dispatch_from_row).collect()
    }

    pub async fn event(&self, event_ref: &EventRef) -> AuditResult<Option<ScanEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM scan_events WHERE scanner_id = ?1 AND sequence_no = ?2");
        let row = sqlx::query(&sql)
            .bind(&event_ref.scanner_id)
            .bind(event_ref.sequence_no as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    pub async fn event_count(&self) -> AuditResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scan_events").fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    /// Events observed at or after `since`
    pub async fn events_since(&self, since: DateTime<Utc>) -> AuditResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scan_events WHERE observed_at >= ?1")
            .bind(to_ms(since))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Filtered event listing, newest first
    pub async fn query(&self, filter: &AuditQuery) -> AuditResult<Vec<ScanEvent>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM scan_events WHERE 1 = 1"));
        if let Some(from) = filter.from {
            qb.push(" AND observed_at >= ").push_bind(to_ms(from));
        }
        if let Some(to) = filter.to {
            qb.push(" AND observed_at < ").push_bind(to_ms(to));
        }
        if let Some(object_id) = &filter.object_id {
            qb.push(" AND object_id = ").push_bind(object_id.clone());
        }
        if let Some(location_id) = &filter.location_id {
            qb.push(" AND location_id = ").push_bind(location_id.clone());
        }
        if let Some(scanner_id) = &filter.scanner_id {
            qb.push(" AND scanner_id = ").push_bind(scanner_id.clone());
        }
        qb.push(" ORDER BY observed_at DESC, sequence_no DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Movement history of one object, newest first
    pub async fn asset_history(&self, object_id: &str, since: Option<DateTime<Utc>>) -> AuditResult<Vec<ScanEvent>> {
        self.query(&AuditQuery { object_id: Some(object_id.to_string()), from: since, ..Default::default() })
            .await
    }

    pub async fn current_position(&self, object_id: &str) -> AuditResult<Option<CurrentPosition>> {
        let row = sqlx::query("SELECT * FROM current_positions WHERE object_id = ?1")
            .bind(object_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    /// Objects whose last known location is `location_id`
    pub async fn location_contents(&self, location_id: &str) -> AuditResult<Vec<CurrentPosition>> {
        let rows = sqlx::query("SELECT * FROM current_positions WHERE location_id = ?1 ORDER BY last_seen DESC")
            .bind(location_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(position_from_row).collect()
    }

    /// Abandoned deliveries updated at or after `since`, newest first
    pub async fn abandoned_dispatches(&self, since: DateTime<Utc>) -> AuditResult<Vec<DispatchRecord>> {
        let sql = format!(
            "SELECT {DISPATCH_COLUMNS} FROM dispatch_records
             WHERE status = 'abandoned' AND updated_at >= ?1 ORDER BY updated_at DESC"
        );
        let rows = sqlx::query(&sql).bind(to_ms(since)).fetch_all(&self.pool).await?;
        rows.iter().map(dispatch_from_row).collect()
    }

    /// Non-terminal deliveries with their events, oldest event first
    pub async fn resumable_dispatches(&self) -> AuditResult<Vec<(ScanEvent, DispatchRecord)>> {
        let rows = sqlx::query(
            "SELECT e.scanner_id, e.sequence_no, e.event_id, e.object_id, e.object_name, e.category,
                    e.location_id, e.location_name, e.observed_at,
                    d.sink, d.notify, d.attempt_count, d.status, d.last_error, d.updated_at
             FROM dispatch_records d
             JOIN scan_events e ON e.scanner_id = d.scanner_id AND e.sequence_no = d.sequence_no
             WHERE d.status_rank < 3
             ORDER BY e.observed_at, e.sequence_no, d.rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| Ok((event_from_row(row)?, dispatch_from_row(row)?))).collect()
    }

    /// Compute and store the report for one UTC day
    pub async fn daily_report(&self, date: NaiveDate) -> AuditResult<DailyReport> {
        let start = date.and_hms_opt(0, 0, 0).map(|t| t.and_utc()).ok_or_else(|| {
            AuditError::Corrupt(format!("date {date}"))
        })?;
        let (start, end) = (to_ms(start), to_ms(start + Duration::days(1)));

        let totals = sqlx::query(
            "SELECT COUNT(*) AS total, COUNT(DISTINCT object_id) AS objects, COUNT(DISTINCT location_id) AS locations
             FROM scan_events WHERE observed_at >= ?1 AND observed_at < ?2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let outcomes = sqlx::query(
            "SELECT COALESCE(SUM(d.status = 'delivered'), 0) AS delivered,
                    COALESCE(SUM(d.status = 'abandoned'), 0) AS abandoned
             FROM dispatch_records d
             JOIN scan_events e ON e.scanner_id = d.scanner_id AND e.sequence_no = d.sequence_no
             WHERE e.observed_at >= ?1 AND e.observed_at < ?2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let most_active_locations = self
            .top_counts("location_id", "location_name", start, end)
            .await?;
        let most_moved_objects = self.top_counts("object_id", "object_name", start, end).await?;

        let report = DailyReport {
            date,
            total_events: totals.try_get::<i64, _>("total")? as u64,
            unique_objects: totals.try_get::<i64, _>("objects")? as u64,
            unique_locations: totals.try_get::<i64, _>("locations")? as u64,
            delivered: outcomes.try_get::<i64, _>("delivered")? as u64,
            abandoned: outcomes.try_get::<i64, _>("abandoned")? as u64,
            most_active_locations,
            most_moved_objects,
        };

        let json = serde_json::to_string(&report).map_err(|e| AuditError::Corrupt(e.to_string()))?;
        sqlx::query(
            "INSERT OR REPLACE INTO daily_stats
                (date, total_events, unique_objects, unique_locations, delivered, abandoned, report, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(date.to_string())
        .bind(report.total_events as i64)
        .bind(report.unique_objects as i64)
        .bind(report.unique_locations as i64)
        .bind(report.delivered as i64)
        .bind(report.abandoned as i64)
        .bind(json)
        .bind(to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(report)
    }

    /// Whether a report for `date` is already stored
    pub async fn has_daily_report(&self, date: NaiveDate) -> AuditResult<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT date FROM daily_stats WHERE date = ?1")
            .bind(date.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn top_counts(&self, id_col: &str, name_col: &str, start: i64, end: i64) -> AuditResult<Vec<CountEntry>> {
        let sql = format!(
            "SELECT {id_col} AS id, MAX({name_col}) AS name, COUNT(*) AS n FROM scan_events
             WHERE observed_at >= ?1 AND observed_at < ?2
             GROUP BY {id_col} ORDER BY n DESC, id LIMIT 5"
        );
        let rows = sqlx::query(&sql).bind(start).bind(end).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(CountEntry {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    count: row.try_get::<i64, _>("n")? as u64,
                })
            })
            .collect()
    }

    /// Remove events older than the retention window whose deliveries are all
    /// terminal, along with their dispatch rows
    pub async fn prune(&self, retention_days: u32, now: DateTime<Utc>) -> AuditResult<u64> {
        let cutoff = to_ms(now - Duration::days(retention_days as i64));
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            "DELETE FROM scan_events
             WHERE observed_at < ?1
               AND NOT EXISTS (
                   SELECT 1 FROM dispatch_records d
                   WHERE d.scanner_id = scan_events.scanner_id
                     AND d.sequence_no = scan_events.sequence_no
                     AND d.status_rank < 3)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "DELETE FROM dispatch_records
             WHERE NOT EXISTS (
                 SELECT 1 FROM scan_events e
                 WHERE e.scanner_id = dispatch_records.scanner_id
                   AND e.sequence_no = dispatch_records.sequence_no)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(removed)
    }
}
