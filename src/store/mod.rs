//! Snapshot store: WAL-mode SQLite database holding desired/observed state,
//! raw event facts, drift observations, incidents and update status.
//!
//! All writes go through one connection guarded by a mutex, so the drift
//! upsert (lookup-then-write inside an IMMEDIATE transaction) is serialized
//! even when detection runs on many threads. An ingest batch is written
//! through a [`BatchWriter`] inside a single transaction. Timestamps are stored as
//! RFC 3339 millisecond strings; set-valued columns as JSON arrays.

#![allow(missing_docs)]

mod drift;
mod events;
mod state;

pub use drift::{DriftFilter, DuplicateOpenKey};
pub use events::IncidentResolution;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{
    Connection, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::errors::{DlgError, Result};
use crate::core::time::{format_ts, parse_ts};
use crate::model::{
    DeployEvent, DesiredServiceSpec, DockerEvent, IncidentMarker, ObservedServiceState,
    StateSnapshot, VersionCheck,
};

/// Handle to the engine database.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| DlgError::io(parent, source))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn, true)?;
        apply_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn, false)?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Path to the database file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Check that WAL mode is active (for diagnostics).
    pub fn is_wal_mode(&self) -> bool {
        self.conn()
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .map(|mode| mode.eq_ignore_ascii_case("wal"))
            .unwrap_or(false)
    }

    // ──────────────────── activity_log ────────────────────

    /// Insert a row into `activity_log`.
    pub fn log_activity(&self, row: &ActivityRow) -> Result<()> {
        self.conn()
            .prepare_cached(
                "INSERT INTO activity_log (
                timestamp, event_type, severity, entity, error_code, details
            ) VALUES (?1,?2,?3,?4,?5,?6)",
            )?
            .execute(params![
                row.timestamp,
                row.event_type,
                row.severity,
                row.entity,
                row.error_code,
                row.details,
            ])?;
        Ok(())
    }

    /// Query recent activity entries, newest first.
    pub fn recent_activity(&self, limit: u32) -> Result<Vec<ActivityRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, event_type, severity, entity, error_code, details
             FROM activity_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(ActivityRow {
                    timestamp: row.get(0)?,
                    event_type: row.get(1)?,
                    severity: row.get(2)?,
                    entity: row.get(3)?,
                    error_code: row.get(4)?,
                    details: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ──────────────────── ingest_log ────────────────────

    /// Whether a batch with this content fingerprint was already ingested.
    pub fn fingerprint_seen(&self, fingerprint: &str) -> Result<bool> {
        fingerprint_seen(&self.conn(), fingerprint)
    }

    /// Record an ingested batch. Re-recording the same fingerprint is ignored.
    pub fn record_ingest(&self, entry: &IngestLogRow) -> Result<()> {
        record_ingest(&self.conn(), entry)
    }

    // ──────────────────── batch writes ────────────────────

    /// Run `body` inside one IMMEDIATE transaction that holds the connection
    /// for its whole duration. Commits when `body` returns `Ok`; any error
    /// rolls back every write made through the [`BatchWriter`].
    pub fn write_batch<T>(&self, body: impl FnOnce(&BatchWriter<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn();
        let writer = BatchWriter {
            tx: conn.transaction_with_behavior(TransactionBehavior::Immediate)?,
        };
        let out = body(&writer)?;
        writer.tx.commit()?;
        Ok(out)
    }
}

/// Append access scoped to one [`Store::write_batch`] transaction.
pub struct BatchWriter<'conn> {
    tx: Transaction<'conn>,
}

impl BatchWriter<'_> {
    pub fn fingerprint_seen(&self, fingerprint: &str) -> Result<bool> {
        fingerprint_seen(&self.tx, fingerprint)
    }

    pub fn record_ingest(&self, entry: &IngestLogRow) -> Result<()> {
        record_ingest(&self.tx, entry)
    }

    pub fn insert_desired_spec(&self, spec: &DesiredServiceSpec) -> Result<i64> {
        state::insert_desired_spec(&self.tx, spec)
    }

    pub fn insert_observed_state(&self, state: &ObservedServiceState) -> Result<i64> {
        state::insert_observed_state(&self.tx, state)
    }

    pub fn insert_snapshot(&self, snapshot: &StateSnapshot) -> Result<bool> {
        state::insert_snapshot(&self.tx, snapshot)
    }

    pub fn insert_version_check(&self, check: &VersionCheck) -> Result<()> {
        state::insert_version_check(&self.tx, check)
    }

    pub fn append_deploy_event(&self, event: &DeployEvent) -> Result<i64> {
        events::append_deploy_event(&self.tx, event)
    }

    pub fn append_docker_event(&self, event: &DockerEvent) -> Result<i64> {
        events::append_docker_event(&self.tx, event)
    }

    pub fn insert_incident(&self, marker: &IncidentMarker) -> Result<i64> {
        events::insert_incident(&self.tx, marker)
    }
}

// ──────────────────── row types ────────────────────

/// Row for the `activity_log` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRow {
    pub timestamp: String,
    pub event_type: String,
    pub severity: String,
    pub entity: Option<String>,
    pub error_code: Option<String>,
    pub details: Option<String>,
}

/// Row for the `ingest_log` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestLogRow {
    pub fingerprint: String,
    pub source: String,
    pub ingested_at: DateTime<Utc>,
    pub accepted: usize,
    pub rejected: usize,
}

// ──────────────────── column helpers ────────────────────

fn conversion_err(idx: usize, err: DlgError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

pub(crate) fn json_at<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e.into()))
}

pub(crate) fn opt_json_at<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_err(idx, e.into())))
        .transpose()
}

/// Parse a closed-enum label column.
pub(crate) fn label_at<T>(
    row: &Row<'_>,
    idx: usize,
    what: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        conversion_err(
            idx,
            DlgError::Serialization {
                context: what,
                details: format!("unknown label {raw:?}"),
            },
        )
    })
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

// ──────────────────── schema & pragmas ────────────────────

fn apply_pragmas(conn: &Connection, on_disk: bool) -> Result<()> {
    conn.execute_batch(
        "PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;
         PRAGMA foreign_keys = ON;",
    )?;
    if on_disk {
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            eprintln!("[DLG-STORE] WARNING: requested WAL mode but got '{mode}'");
        }
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS desired_specs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            app TEXT NOT NULL,
            service TEXT NOT NULL,
            environment TEXT NOT NULL,
            image TEXT NOT NULL,
            tag TEXT NOT NULL,
            domains TEXT NOT NULL,
            labels TEXT NOT NULL,
            volumes TEXT NOT NULL,
            networks TEXT NOT NULL,
            source_file TEXT NOT NULL,
            loaded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS observed_states (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service TEXT NOT NULL,
            host TEXT NOT NULL,
            container_name TEXT,
            image TEXT NOT NULL,
            tag TEXT NOT NULL,
            replicas TEXT NOT NULL,
            state TEXT NOT NULL,
            ports TEXT NOT NULL,
            networks TEXT NOT NULL,
            created_at TEXT,
            observed_at TEXT NOT NULL,
            snapshot_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS state_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            snapshot_id TEXT NOT NULL,
            host TEXT NOT NULL,
            disk_usage_pct REAL NOT NULL,
            memory_usage_pct REAL NOT NULL,
            service_count INTEGER NOT NULL,
            container_count INTEGER NOT NULL,
            captured_at TEXT NOT NULL,
            payload TEXT NOT NULL,
            UNIQUE (snapshot_id, host)
        );

        CREATE TABLE IF NOT EXISTS deploy_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            app TEXT NOT NULL,
            environment TEXT,
            image_before TEXT,
            image_after TEXT,
            triggered_by TEXT,
            job_id TEXT,
            occurred_at TEXT NOT NULL,
            details TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS docker_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            container_name TEXT NOT NULL,
            service TEXT,
            host TEXT NOT NULL,
            exit_code INTEGER,
            occurred_at TEXT NOT NULL,
            details TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            severity TEXT NOT NULL,
            started_at TEXT NOT NULL,
            resolved_at TEXT,
            affected_services TEXT NOT NULL,
            root_cause TEXT,
            resolution TEXT,
            knowledge_pack TEXT,
            timeline_query TEXT
        );

        CREATE TABLE IF NOT EXISTS drift_observations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service_name TEXT NOT NULL,
            category TEXT NOT NULL,
            severity TEXT NOT NULL,
            desired_value TEXT NOT NULL,
            actual_value TEXT NOT NULL,
            description TEXT NOT NULL,
            blast_radius INTEGER NOT NULL DEFAULT 1 CHECK (blast_radius >= 1),
            first_seen_at TEXT NOT NULL,
            resolved_at TEXT,
            resolution TEXT
        );

        CREATE TABLE IF NOT EXISTS version_checks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service TEXT NOT NULL,
            deployed_version TEXT NOT NULL,
            latest_version TEXT NOT NULL,
            checked_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS update_status (
            service TEXT PRIMARY KEY,
            deployed_version TEXT NOT NULL,
            latest_version TEXT NOT NULL,
            status TEXT NOT NULL,
            last_checked TEXT NOT NULL,
            last_incident TEXT,
            risk TEXT NOT NULL,
            details TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS activity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            entity TEXT,
            error_code TEXT,
            details TEXT
        );

        CREATE TABLE IF NOT EXISTS ingest_log (
            fingerprint TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            ingested_at TEXT NOT NULL,
            accepted INTEGER NOT NULL,
            rejected INTEGER NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_drift_open_key
            ON drift_observations(service_name, category) WHERE resolved_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_drift_first_seen ON drift_observations(first_seen_at);
        CREATE INDEX IF NOT EXISTS idx_desired_source ON desired_specs(source_file, loaded_at);
        CREATE INDEX IF NOT EXISTS idx_observed_host_time ON observed_states(host, observed_at);
        CREATE INDEX IF NOT EXISTS idx_snapshots_host_time ON state_snapshots(host, captured_at);
        CREATE INDEX IF NOT EXISTS idx_deploy_time ON deploy_events(occurred_at);
        CREATE INDEX IF NOT EXISTS idx_docker_time ON docker_events(occurred_at);
        CREATE INDEX IF NOT EXISTS idx_incidents_started ON incidents(started_at);
        CREATE INDEX IF NOT EXISTS idx_version_checks_service
            ON version_checks(service, checked_at);
        CREATE INDEX IF NOT EXISTS idx_activity_timestamp ON activity_log(timestamp);",
    )?;
    Ok(())
}

// ──────────────────── tests ────────────────────

// ──────────────────── connection-level statements ────────────────────

pub(super) fn fingerprint_seen(conn: &Connection, fingerprint: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM ingest_log WHERE fingerprint = ?1",
            params![fingerprint],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(super) fn record_ingest(conn: &Connection, entry: &IngestLogRow) -> Result<()> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO ingest_log (
        fingerprint, source, ingested_at, accepted, rejected
    ) VALUES (?1,?2,?3,?4,?5)",
    )?
    .execute(params![
        entry.fingerprint,
        entry.source,
        format_ts(entry.ingested_at),
        entry.accepted as i64,
        entry.rejected as i64,
    ])?;
    Ok(())
}
