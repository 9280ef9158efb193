//! Periodic cycle runner: drain the batch inbox, reconcile, recompute update
//! risk, then sleep in short ticks until the next cycle or a signal.
//!
//! Threads: the runner (main) and the logger thread fed through a bounded
//! crossbeam channel (via dual.rs). Per-service detection fans out inside
//! `Reconciler::run` and joins before the cycle completes.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::{DlgError, Result};
use crate::daemon::signals::SignalHandler;
use crate::ingest::ingest_document;
use crate::logger::dual::{
    ActivityEvent, ActivityLoggerHandle, DualLoggerConfig, ingest_events, reconcile_events,
    spawn_logger,
};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::store::Store;
use crate::updates::track_updates;

const DONE_SUFFIX: &str = "done";
const REJECTED_SUFFIX: &str = "rejected";

// ──────────────────── inbox ────────────────────

/// What happened to the inbox files of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InboxOutcome {
    pub ingested: Vec<PathBuf>,
    pub duplicates: Vec<PathBuf>,
    pub rejected: Vec<PathBuf>,
}

impl InboxOutcome {
    #[must_use]
    pub fn files_seen(&self) -> usize {
        self.ingested.len() + self.duplicates.len() + self.rejected.len()
    }
}

/// Pending `*.json` batch files, in name order. A missing inbox is empty.
pub fn pending_batches(inbox: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(inbox) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DlgError::io(inbox, e)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| DlgError::io(inbox, e))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// `batch.json` -> `batch.json.<suffix>`.
fn mark(path: &Path, suffix: &str) -> Result<PathBuf> {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    let target = path.with_file_name(name);
    fs::rename(path, &target).map_err(|e| DlgError::io(path, e))?;
    Ok(target)
}

fn is_unparseable(err: &DlgError) -> bool {
    matches!(
        err,
        DlgError::MalformedRecord { kind: "batch", .. } | DlgError::Serialization { .. }
    )
}

/// Ingest every pending batch file. Unparseable files are set aside as
/// `.rejected`; storage failures stop the drain and leave the file in place
/// for the next cycle.
pub fn process_inbox(
    store: &Store,
    inbox: &Path,
    logger: &ActivityLoggerHandle,
    now: DateTime<Utc>,
) -> Result<InboxOutcome> {
    let mut outcome = InboxOutcome::default();
    for path in pending_batches(inbox)? {
        let source = path.display().to_string();
        let bytes = fs::read(&path).map_err(|e| DlgError::io(&path, e))?;
        match ingest_document(store, &source, &bytes, now) {
            Ok(report) => {
                logger.send_all(ingest_events(&source, &report));
                let duplicate = report.duplicate;
                let marked = mark(&path, DONE_SUFFIX)?;
                if duplicate {
                    outcome.duplicates.push(marked);
                } else {
                    outcome.ingested.push(marked);
                }
            }
            Err(e) if is_unparseable(&e) => {
                eprintln!("[DLG-INBOX] rejecting {source}: {e}");
                logger.send(ActivityEvent::Error {
                    code: e.code().to_string(),
                    message: format!("{source}: {e}"),
                });
                outcome.rejected.push(mark(&path, REJECTED_SUFFIX)?);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(outcome)
}

// ──────────────────── cycle ────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub inbox: InboxOutcome,
    pub reconcile: ReconcileReport,
    pub updates_checked: usize,
    pub updates_pending: usize,
    pub duration_ms: u64,
}

/// One full cycle against `store`: inbox, reconciliation, update risk.
///
/// An invariant violation is logged and returned; the cycle stops there.
pub fn run_cycle(
    store: &Store,
    config: &Config,
    logger: &ActivityLoggerHandle,
    cycle: u64,
    now: DateTime<Utc>,
) -> Result<CycleSummary> {
    let started = Instant::now();
    logger.send(ActivityEvent::CycleStarted { cycle });

    let inbox = process_inbox(store, &config.paths.inbox_dir, logger, now)?;

    let reconcile = match Reconciler::new(store, config.reconcile.clone()).run(now) {
        Ok(report) => report,
        Err(e) if e.is_invariant_violation() => {
            eprintln!("[DLG-DAEMON] invariant violation, halting cycle {cycle}: {e}");
            logger.send(ActivityEvent::InvariantViolation {
                code: e.code(),
                details: e.to_string(),
            });
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    logger.send_all(reconcile_events(&reconcile));

    let updates = track_updates(store, &config.updates)?;
    logger.send_all(updates.statuses.iter().cloned().map(ActivityEvent::UpdateChecked));

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    logger.send(ActivityEvent::CycleCompleted {
        cycle,
        services_checked: reconcile.services_checked,
        opened: reconcile.opened.len(),
        resolved: reconcile.resolved.len(),
        failures: reconcile.failures.len(),
        duration_ms,
    });

    Ok(CycleSummary {
        cycle,
        inbox,
        reconcile,
        updates_checked: updates.checked,
        updates_pending: updates.pending,
        duration_ms,
    })
}

// ──────────────────── daemon ────────────────────

pub struct DriftDaemon {
    config: Config,
    store: Store,
    logger_handle: ActivityLoggerHandle,
    logger_join: Option<thread::JoinHandle<()>>,
    signals: SignalHandler,
    cycles_run: u64,
    start_time: Instant,
}

impl DriftDaemon {
    /// Open the store, spawn the logger thread and install signal handlers.
    pub fn new(config: Config) -> Result<Self> {
        let store = Store::open(&config.paths.sqlite_db)?;
        let (logger_handle, join) = spawn_logger(DualLoggerConfig::from_config(&config))?;
        Ok(Self {
            config,
            store,
            logger_handle,
            logger_join: Some(join),
            signals: SignalHandler::install(),
            cycles_run: 0,
            start_time: Instant::now(),
        })
    }

    /// Assemble from existing parts; no threads or signal handlers are started.
    #[must_use]
    pub fn with_parts(
        config: Config,
        store: Store,
        logger_handle: ActivityLoggerHandle,
        signals: SignalHandler,
    ) -> Self {
        Self {
            config,
            store,
            logger_handle,
            logger_join: None,
            signals,
            cycles_run: 0,
            start_time: Instant::now(),
        }
    }

    #[must_use]
    pub const fn signals(&self) -> &SignalHandler {
        &self.signals
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn cycles_run(&self) -> u64 {
        self.cycles_run
    }

    /// Run cycles until a shutdown signal arrives. Returns the error that
    /// stopped the loop if it was an invariant violation.
    pub fn run(&mut self) -> Result<()> {
        let config_hash = self.config.stable_hash().unwrap_or_default();
        self.logger_handle.send(ActivityEvent::DaemonStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash,
        });
        eprintln!(
            "[DLG-DAEMON] started: interval={}s inbox={}",
            self.config.daemon.interval_secs,
            self.config.paths.inbox_dir.display()
        );

        let mut outcome = Ok(());
        let mut next_cycle = Instant::now();
        while !self.signals.should_shutdown() {
            if self.signals.take_reload() {
                self.handle_config_reload();
            }
            if self.signals.take_cycle_request() {
                next_cycle = Instant::now();
            }
            if Instant::now() >= next_cycle {
                if let Err(e) = self.run_cycle_now(Utc::now()) {
                    if e.is_invariant_violation() {
                        outcome = Err(e);
                        break;
                    }
                }
                next_cycle = Instant::now() + Duration::from_secs(self.config.daemon.interval_secs);
            }
            thread::sleep(Duration::from_millis(self.config.daemon.tick_ms));
        }

        let reason = match &outcome {
            Ok(()) => "signal".to_string(),
            Err(e) => format!("halted: {}", e.code()),
        };
        self.shutdown(&reason);
        outcome
    }

    /// Run one cycle immediately. Non-fatal failures are logged and returned.
    pub fn run_cycle_now(&mut self, now: DateTime<Utc>) -> Result<CycleSummary> {
        self.cycles_run += 1;
        let cycle = self.cycles_run;
        let result = run_cycle(&self.store, &self.config, &self.logger_handle, cycle, now);
        match &result {
            Ok(summary) => eprintln!(
                "[DLG-DAEMON] cycle {cycle}: {} files, {} services, +{} drift, -{} drift, {} failures",
                summary.inbox.files_seen(),
                summary.reconcile.services_checked,
                summary.reconcile.opened.len(),
                summary.reconcile.resolved.len(),
                summary.reconcile.failures.len()
            ),
            Err(e) if !e.is_invariant_violation() => {
                eprintln!("[DLG-DAEMON] cycle {cycle} failed: {e}");
                self.logger_handle.send(ActivityEvent::Error {
                    code: e.code().to_string(),
                    message: format!("cycle {cycle} failed: {e}"),
                });
            }
            Err(_) => {}
        }
        result
    }

    // ──────────────────── config reload ────────────────────

    fn handle_config_reload(&mut self) {
        eprintln!("[DLG-DAEMON] config reload requested (SIGHUP)");

        match Config::load(Some(&self.config.paths.config_file)) {
            Ok(new_config) => {
                let old_hash = self.config.stable_hash().unwrap_or_default();
                let new_hash = new_config.stable_hash().unwrap_or_default();
                if old_hash == new_hash {
                    eprintln!("[DLG-DAEMON] config unchanged, skipping reload");
                    return;
                }
                if new_config.paths.sqlite_db != self.config.paths.sqlite_db {
                    eprintln!("[DLG-DAEMON] paths.sqlite_db change takes effect on restart");
                }
                self.logger_handle.send(ActivityEvent::ConfigReloaded {
                    details: format!("config hash: {old_hash} -> {new_hash}"),
                });
                let keep_db = self.config.paths.sqlite_db.clone();
                self.config = new_config;
                self.config.paths.sqlite_db = keep_db;
                eprintln!("[DLG-DAEMON] config reloaded successfully");
            }
            Err(e) => {
                eprintln!("[DLG-DAEMON] config reload failed: {e}");
                self.logger_handle.send(ActivityEvent::Error {
                    code: e.code().to_string(),
                    message: format!("config reload failed: {e}"),
                });
            }
        }
    }

    // ──────────────────── shutdown ────────────────────

    fn shutdown(&mut self, reason: &str) {
        let uptime_secs = self.start_time.elapsed().as_secs();
        eprintln!("[DLG-DAEMON] stopping after {} cycles ({reason})", self.cycles_run);
        self.logger_handle.send(ActivityEvent::DaemonStopped {
            reason: reason.to_string(),
            uptime_secs,
        });
        self.logger_handle.shutdown();
        if let Some(join) = self.logger_join.take() {
            let _ = join.join();
        }
    }
}
