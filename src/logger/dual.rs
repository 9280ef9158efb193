//! Dual-write activity logging: JSONL file plus the `activity_log` table.
//!
//! A dedicated logger thread owns the [`JsonlWriter`] and its own [`Store`]
//! connection. Everything else sends [`ActivityEvent`]s over a bounded
//! crossbeam channel with `try_send`, so a slow disk never stalls a cycle;
//! events that do not fit are counted and reported on the next write.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::config::Config;
use crate::core::errors::{DlgError, Result};
use crate::ingest::IngestReport;
use crate::logger::jsonl::{EventKind, JsonlConfig, JsonlWriter, LogEntry, LogLevel};
use crate::model::{DriftObservation, IncidentMarker, IncidentSeverity, Severity, UpdateStatus};
use crate::reconcile::ReconcileReport;
use crate::store::{ActivityRow, Store};

const CHANNEL_CAPACITY: usize = 1024;

/// Consecutive SQLite failures before the table sink is dropped.
const SQLITE_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone)]
pub enum ActivityEvent {
    CycleStarted {
        cycle: u64,
    },
    CycleCompleted {
        cycle: u64,
        services_checked: usize,
        opened: usize,
        resolved: usize,
        failures: usize,
        duration_ms: u64,
    },
    BatchIngested {
        source: String,
        accepted: usize,
        rejected: usize,
        duplicate: bool,
    },
    RecordRejected {
        source: String,
        kind: &'static str,
        index: usize,
        code: &'static str,
        details: String,
    },
    ServiceFailed {
        service: String,
        code: &'static str,
        details: String,
    },
    DriftOpened(DriftObservation),
    DriftUpdated(DriftObservation),
    DriftResolved(DriftObservation),
    UpdateChecked(UpdateStatus),
    IncidentCreated(IncidentMarker),
    IncidentResolved(IncidentMarker),
    InvariantViolation {
        code: &'static str,
        details: String,
    },
    DaemonStarted {
        version: String,
        config_hash: String,
    },
    DaemonStopped {
        reason: String,
        uptime_secs: u64,
    },
    ConfigReloaded {
        details: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Ask the logger thread to flush and exit.
    Shutdown,
}

const fn drift_level(severity: Severity) -> LogLevel {
    match severity {
        Severity::Critical => LogLevel::Critical,
        Severity::High | Severity::Medium => LogLevel::Warning,
        Severity::Low => LogLevel::Info,
    }
}

fn drift_entry(kind: EventKind, obs: &DriftObservation, level: LogLevel) -> LogEntry {
    let mut e = LogEntry::new(kind, level).entity(&obs.service_name);
    e.category = Some(obs.category.as_str().to_string());
    e.record_id = Some(obs.id);
    e.details = Some(match &obs.resolution {
        Some(resolution) => resolution.clone(),
        None => format!(
            "desired={} actual={} blast_radius={}",
            obs.desired_value, obs.actual_value, obs.blast_radius
        ),
    });
    e
}

impl ActivityEvent {
    #[allow(clippy::too_many_lines)]
    #[must_use]
    pub fn to_entry(&self) -> LogEntry {
        match self {
            Self::CycleStarted { cycle } => {
                let mut e = LogEntry::new(EventKind::CycleStart, LogLevel::Info);
                e.record_id = i64::try_from(*cycle).ok();
                e
            }
            Self::CycleCompleted {
                cycle,
                services_checked,
                opened,
                resolved,
                failures,
                duration_ms,
            } => {
                let level = if *failures == 0 {
                    LogLevel::Info
                } else {
                    LogLevel::Warning
                };
                let mut e = LogEntry::new(EventKind::CycleComplete, level).details(format!(
                    "services={services_checked} opened={opened} resolved={resolved} failures={failures}"
                ));
                e.record_id = i64::try_from(*cycle).ok();
                e.duration_ms = Some(*duration_ms);
                e.ok = Some(*failures == 0);
                e
            }
            Self::BatchIngested {
                source,
                accepted,
                rejected,
                duplicate,
            } => {
                let mut e = LogEntry::new(EventKind::BatchIngested, LogLevel::Info)
                    .entity(source)
                    .details(format!(
                        "accepted={accepted} rejected={rejected} duplicate={duplicate}"
                    ));
                e.count = u64::try_from(*accepted).ok();
                e.ok = Some(*rejected == 0);
                e
            }
            Self::RecordRejected {
                source,
                kind,
                index,
                code,
                details,
            } => {
                let mut e = LogEntry::new(EventKind::RecordRejected, LogLevel::Warning)
                    .entity(source)
                    .details(format!("{kind} #{index}: {details}"));
                e.error_code = Some((*code).to_string());
                e.ok = Some(false);
                e
            }
            Self::ServiceFailed {
                service,
                code,
                details,
            } => {
                let mut e = LogEntry::new(EventKind::ServiceFailed, LogLevel::Warning)
                    .entity(service)
                    .details(details.clone());
                e.error_code = Some((*code).to_string());
                e.ok = Some(false);
                e
            }
            Self::DriftOpened(obs) => {
                drift_entry(EventKind::DriftOpened, obs, drift_level(obs.severity))
            }
            Self::DriftUpdated(obs) => drift_entry(EventKind::DriftUpdated, obs, LogLevel::Info),
            Self::DriftResolved(obs) => drift_entry(EventKind::DriftResolved, obs, LogLevel::Info),
            Self::UpdateChecked(status) => {
                let level = if status.status.is_pending() {
                    LogLevel::Warning
                } else {
                    LogLevel::Info
                };
                let mut e = LogEntry::new(EventKind::UpdateChecked, level)
                    .entity(&status.service)
                    .details(format!("{} risk={}", status.status, status.risk));
                e.category = Some(status.status.as_str().to_string());
                e
            }
            Self::IncidentCreated(marker) => {
                let level = match marker.severity {
                    IncidentSeverity::Critical => LogLevel::Critical,
                    IncidentSeverity::Warning => LogLevel::Warning,
                    IncidentSeverity::Info => LogLevel::Info,
                };
                let mut e = LogEntry::new(EventKind::IncidentCreated, level)
                    .entity(
                        marker
                            .affected_services
                            .iter()
                            .map(String::as_str)
                            .collect::<Vec<_>>()
                            .join(","),
                    )
                    .details(marker.title.clone());
                e.record_id = Some(marker.id);
                e
            }
            Self::IncidentResolved(marker) => {
                let mut e = LogEntry::new(EventKind::IncidentResolved, LogLevel::Info)
                    .details(marker.root_cause.clone().unwrap_or_default());
                e.record_id = Some(marker.id);
                e.ok = Some(true);
                e
            }
            Self::InvariantViolation { code, details } => {
                let mut e = LogEntry::new(EventKind::InvariantViolation, LogLevel::Critical)
                    .details(details.clone());
                e.error_code = Some((*code).to_string());
                e.ok = Some(false);
                e
            }
            Self::DaemonStarted {
                version,
                config_hash,
            } => {
                let mut e = LogEntry::new(EventKind::DaemonStart, LogLevel::Info)
                    .details(format!("version={version} config_hash={config_hash}"));
                e.ok = Some(true);
                e
            }
            Self::DaemonStopped {
                reason,
                uptime_secs,
            } => LogEntry::new(EventKind::DaemonStop, LogLevel::Info)
                .details(format!("reason={reason} uptime={uptime_secs}s")),
            Self::ConfigReloaded { details } => {
                LogEntry::new(EventKind::ConfigReload, LogLevel::Info).details(details.clone())
            }
            Self::Error { code, message } => {
                let mut e =
                    LogEntry::new(EventKind::Error, LogLevel::Critical).details(message.clone());
                e.error_code = Some(code.clone());
                e.ok = Some(false);
                e
            }
            Self::Shutdown => LogEntry::new(EventKind::DaemonStop, LogLevel::Info),
        }
    }
}

/// Activity table row for a JSONL entry.
fn activity_row(entry: &LogEntry) -> ActivityRow {
    ActivityRow {
        timestamp: entry.ts.clone(),
        event_type: entry.event.as_str().to_string(),
        severity: entry.severity.as_str().to_string(),
        entity: entry.entity.clone(),
        error_code: entry.error_code.clone(),
        details: entry.details.clone(),
    }
}

// ──────────────────── report expansion ────────────────────

/// One event per drift transition and per failed service.
#[must_use]
pub fn reconcile_events(report: &ReconcileReport) -> Vec<ActivityEvent> {
    let opened = report.opened.iter().cloned().map(ActivityEvent::DriftOpened);
    let updated = report.updated.iter().cloned().map(ActivityEvent::DriftUpdated);
    let resolved = report.resolved.iter().cloned().map(ActivityEvent::DriftResolved);
    let failed = report.failures.iter().map(|f| ActivityEvent::ServiceFailed {
        service: f.service.clone(),
        code: f.code,
        details: f.details.clone(),
    });
    opened.chain(updated).chain(resolved).chain(failed).collect()
}

/// The batch summary followed by one event per rejected record.
#[must_use]
pub fn ingest_events(source: &str, report: &IngestReport) -> Vec<ActivityEvent> {
    std::iter::once(ActivityEvent::BatchIngested {
        source: source.to_string(),
        accepted: report.accepted.total(),
        rejected: report.rejected.len(),
        duplicate: report.duplicate,
    })
    .chain(report.rejected.iter().map(|r| ActivityEvent::RecordRejected {
        source: source.to_string(),
        kind: r.kind,
        index: r.index,
        code: r.code,
        details: r.details.clone(),
    }))
    .collect()
}

// ──────────────────── handle ────────────────────

/// Cheaply cloneable sender side of the logger.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// A handle with no logger thread behind it; every event is discarded.
    #[must_use]
    pub fn detached() -> Self {
        let (tx, _rx) = bounded(1);
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Non-blocking send. A full channel drops the event and bumps the counter.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn send_all(&self, events: impl IntoIterator<Item = ActivityEvent>) {
        for event in events {
            self.send(event);
        }
    }

    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Blocking: the shutdown sentinel must not be dropped.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

pub struct DualLoggerConfig {
    /// Engine database; `None` writes JSONL only.
    pub sqlite_path: Option<PathBuf>,
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
}

impl DualLoggerConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            sqlite_path: Some(config.paths.sqlite_db.clone()),
            jsonl_config: JsonlConfig::at(config.paths.jsonl_log.clone()),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread. It runs until `shutdown()` or until every handle is dropped.
pub fn spawn_logger(
    config: DualLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };
    let join = thread::Builder::new()
        .name("dlg-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config, &dropped))
        .map_err(|e| DlgError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;
    Ok((handle, join))
}

fn logger_thread_main(
    rx: &Receiver<ActivityEvent>,
    config: DualLoggerConfig,
    dropped: &AtomicU64,
) {
    let mut store = config.sqlite_path.and_then(|p| match Store::open(&p) {
        Ok(store) => Some(store),
        Err(e) => {
            eprintln!("[DLG-LOGGER] activity table unavailable at {}: {e}", p.display());
            None
        }
    });
    let mut jsonl = JsonlWriter::open(config.jsonl_config);
    let mut sqlite_failures = 0u32;

    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let warn = LogEntry::new(EventKind::Error, LogLevel::Warning)
                .details(format!("{lost} activity events dropped under back-pressure"));
            jsonl.write_entry(&warn);
        }
        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }

        let entry = event.to_entry();
        jsonl.write_entry(&entry);
        if let Some(db) = &store {
            if db.log_activity(&activity_row(&entry)).is_ok() {
                sqlite_failures = 0;
            } else {
                sqlite_failures += 1;
                if sqlite_failures >= SQLITE_FAILURE_LIMIT {
                    eprintln!(
                        "[DLG-LOGGER] activity table write failed {sqlite_failures} times, disabling"
                    );
                    store = None;
                }
            }
        }
    }
    jsonl.flush();
    jsonl.fsync();
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::DriftCategory;

    fn config(dir: &std::path::Path, sqlite: bool) -> DualLoggerConfig {
        DualLoggerConfig {
            sqlite_path: sqlite.then(|| dir.join("dlg.sqlite3")),
            jsonl_config: JsonlConfig {
                fsync_interval_secs: 60,
                ..JsonlConfig::at(dir.join("activity.jsonl"))
            },
            channel_capacity: 64,
        }
    }

    fn drift() -> DriftObservation {
        DriftObservation {
            id: 4,
            service_name: "api".to_string(),
            category: DriftCategory::RouteOrphaned,
            severity: Severity::Critical,
            desired_value: "running".to_string(),
            actual_value: "absent".to_string(),
            description: String::new(),
            blast_radius: 2,
            first_seen_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        }
    }

    #[test]
    fn events_reach_both_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(config(dir.path(), true)).unwrap();
        handle.send(ActivityEvent::DaemonStarted {
            version: "0.1.0".to_string(),
            config_hash: "abc".to_string(),
        });
        handle.send(ActivityEvent::DriftOpened(drift()));
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("activity.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("drift_opened"));

        let store = Store::open(&dir.path().join("dlg.sqlite3")).unwrap();
        let rows = store.recent_activity(10).unwrap();
        assert_eq!(rows.len(), 2);
        let opened = rows.iter().find(|r| r.event_type == "drift_opened").unwrap();
        assert_eq!(opened.entity.as_deref(), Some("api"));
        assert_eq!(opened.severity, "critical");
    }

    #[test]
    fn jsonl_only_without_database() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(config(dir.path(), false)).unwrap();
        handle.send(ActivityEvent::Error {
            code: "DLG-3900".to_string(),
            message: "boom".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();
        let contents = std::fs::read_to_string(dir.path().join("activity.jsonl")).unwrap();
        assert!(contents.contains("DLG-3900"));
        assert!(!dir.path().join("dlg.sqlite3").exists());
    }

    #[test]
    fn detached_handle_discards_silently() {
        let handle = ActivityLoggerHandle::detached();
        handle.send(ActivityEvent::CycleStarted { cycle: 1 });
        handle.shutdown();
        assert_eq!(handle.dropped_events(), 0);
    }

    #[test]
    fn reconcile_report_expands_per_transition() {
        let mut resolved = drift();
        resolved.resolved_at = Some(Utc::now());
        resolved.resolution = Some("condition cleared".to_string());
        let report = ReconcileReport {
            services_checked: 2,
            opened: vec![drift()],
            updated: Vec::new(),
            resolved: vec![resolved],
            unchanged: 0,
            failures: vec![crate::reconcile::ServiceFailure {
                service: "worker".to_string(),
                code: "DLG-2002",
                details: "bad replicas".to_string(),
            }],
        };
        let events = reconcile_events(&report);
        assert_eq!(events.len(), 3);
        let kinds: Vec<_> = events.iter().map(|e| e.to_entry().event).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::DriftOpened,
                EventKind::DriftResolved,
                EventKind::ServiceFailed
            ]
        );
        assert_eq!(events[1].to_entry().details.as_deref(), Some("condition cleared"));
    }
}
