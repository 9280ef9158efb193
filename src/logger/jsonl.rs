//! Append-only JSONL activity log.
//!
//! One self-contained JSON object per line, assembled in memory and written
//! with a single `write_all` so tailing readers never see a partial line.
//!
//! When a sink fails the writer steps down: primary file, then fallback
//! file, then stderr with a `[DLG-JSONL]` prefix, then silent discard.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::errors::{DlgError, Result};
use crate::core::time::format_ts;

const WRITE_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Critical,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Activity event kinds as they appear in the `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CycleStart,
    CycleComplete,
    BatchIngested,
    RecordRejected,
    ServiceFailed,
    DriftOpened,
    DriftUpdated,
    DriftResolved,
    UpdateChecked,
    IncidentCreated,
    IncidentResolved,
    InvariantViolation,
    DaemonStart,
    DaemonStop,
    ConfigReload,
    Error,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CycleStart => "cycle_start",
            Self::CycleComplete => "cycle_complete",
            Self::BatchIngested => "batch_ingested",
            Self::RecordRejected => "record_rejected",
            Self::ServiceFailed => "service_failed",
            Self::DriftOpened => "drift_opened",
            Self::DriftUpdated => "drift_updated",
            Self::DriftResolved => "drift_resolved",
            Self::UpdateChecked => "update_checked",
            Self::IncidentCreated => "incident_created",
            Self::IncidentResolved => "incident_resolved",
            Self::InvariantViolation => "invariant_violation",
            Self::DaemonStart => "daemon_start",
            Self::DaemonStop => "daemon_stop",
            Self::ConfigReload => "config_reload",
            Self::Error => "error",
        }
    }
}

/// One JSONL line. `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: String,
    pub event: EventKind,
    pub severity: LogLevel,
    /// Service, host or incident the event is about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Entry stamped with the current UTC time.
    #[must_use]
    pub fn new(event: EventKind, severity: LogLevel) -> Self {
        Self {
            ts: format_ts(chrono::Utc::now()),
            event,
            severity,
            entity: None,
            category: None,
            record_id: None,
            count: None,
            duration_ms: None,
            ok: None,
            error_code: None,
            details: None,
        }
    }

    #[must_use]
    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the active file would exceed this size.
    pub max_size_bytes: u64,
    /// Rotated generations kept as `<path>.1` .. `<path>.N`.
    pub max_rotated_files: u32,
    pub fsync_interval_secs: u64,
}

impl JsonlConfig {
    /// Defaults for a log at `path` with no fallback file.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback_path: None,
            max_size_bytes: 50 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 10,
        }
    }
}

enum Sink {
    File {
        out: BufWriter<File>,
        path: PathBuf,
        is_fallback: bool,
        bytes: u64,
    },
    Stderr,
    Discard,
}

/// JSONL writer with size rotation and a degradation chain.
pub struct JsonlWriter {
    config: JsonlConfig,
    sink: Sink,
    last_fsync: Instant,
}

impl JsonlWriter {
    #[must_use]
    pub fn open(config: JsonlConfig) -> Self {
        let sink = open_sink(&config.path, false)
            .or_else(|| fallback_sink(&config))
            .unwrap_or_else(|| {
                eprintln!("[DLG-JSONL] no writable log file, logging to stderr");
                Sink::Stderr
            });
        Self {
            config,
            sink,
            last_fsync: Instant::now(),
        }
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(mut line) => {
                line.push('\n');
                self.write_line(&line);
            }
            Err(e) => eprintln!("[DLG-JSONL] serialize error: {e}"),
        }
    }

    pub fn flush(&mut self) {
        if let Sink::File { out, .. } = &mut self.sink {
            let _ = out.flush();
        }
    }

    pub fn fsync(&mut self) {
        if let Sink::File { out, .. } = &mut self.sink {
            let _ = out.flush();
            let _ = out.get_ref().sync_data();
        }
        self.last_fsync = Instant::now();
    }

    /// `normal`, `fallback`, `stderr` or `discard`.
    #[must_use]
    pub fn state(&self) -> &'static str {
        match &self.sink {
            Sink::File {
                is_fallback: false, ..
            } => "normal",
            Sink::File {
                is_fallback: true, ..
            } => "fallback",
            Sink::Stderr => "stderr",
            Sink::Discard => "discard",
        }
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        let full = matches!(
            &self.sink,
            Sink::File { bytes, .. } if *bytes > 0 && *bytes + len > self.config.max_size_bytes
        );
        if full {
            self.rotate();
        }
        let failed = match &mut self.sink {
            Sink::File { out, bytes, .. } => {
                let ok = out.write_all(line.as_bytes()).is_ok();
                if ok {
                    *bytes += len;
                }
                !ok
            }
            Sink::Stderr => {
                let _ = write!(io::stderr(), "[DLG-JSONL] {line}");
                false
            }
            Sink::Discard => false,
        };
        if failed {
            self.step_down();
            self.write_line(line);
            return;
        }
        if self.last_fsync.elapsed().as_secs() >= self.config.fsync_interval_secs {
            self.fsync();
        }
    }

    fn step_down(&mut self) {
        self.sink = match &self.sink {
            Sink::File {
                is_fallback: false, ..
            } => fallback_sink(&self.config).unwrap_or(Sink::Stderr),
            Sink::File { .. } => {
                eprintln!("[DLG-JSONL] fallback write failed, logging to stderr");
                Sink::Stderr
            }
            Sink::Stderr | Sink::Discard => Sink::Discard,
        };
    }

    fn rotate(&mut self) {
        let Sink::File {
            out,
            path,
            is_fallback,
            ..
        } = &mut self.sink
        else {
            return;
        };
        let _ = out.flush();
        let (path, is_fallback) = (path.clone(), *is_fallback);

        let keep = self.config.max_rotated_files.max(1);
        let _ = fs::remove_file(generation(&path, keep));
        for n in (1..keep).rev() {
            let _ = fs::rename(generation(&path, n), generation(&path, n + 1));
        }
        let _ = fs::rename(&path, generation(&path, 1));

        match open_sink(&path, is_fallback) {
            Some(sink) => self.sink = sink,
            None => self.step_down(),
        }
    }

    /// Return to the primary file when it is writable again.
    pub fn try_recover(&mut self) {
        if self.state() == "normal" {
            return;
        }
        if let Some(sink) = open_sink(&self.config.path, false) {
            self.sink = sink;
            eprintln!(
                "[DLG-JSONL] recovered primary log {}",
                self.config.path.display()
            );
        }
    }
}

fn fallback_sink(config: &JsonlConfig) -> Option<Sink> {
    let path = config.fallback_path.as_ref()?;
    let sink = open_sink(path, true)?;
    eprintln!("[DLG-JSONL] primary log unavailable, using {}", path.display());
    Some(sink)
}

fn open_sink(path: &Path, is_fallback: bool) -> Option<Sink> {
    let (file, bytes) = open_append(path).ok()?;
    Some(Sink::File {
        out: BufWriter::with_capacity(WRITE_BUFFER, file),
        path: path.to_path_buf(),
        is_fallback,
        bytes,
    })
}

fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| DlgError::io(parent, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DlgError::io(path, e))?;
    let bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, bytes))
}

/// `activity.jsonl` -> `activity.jsonl.3`.
fn generation(base: &Path, n: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}
