//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{DlgError, Result};

/// Largest accepted correlation margin (7 days).
pub const MAX_MARGIN_MINUTES: i64 = 7 * 24 * 60;
/// Largest accepted crash-loop window (7 days).
pub const MAX_CRASH_LOOP_WINDOW_MINUTES: i64 = 7 * 24 * 60;
/// Largest accepted incident lookback for update risk.
pub const MAX_RECENT_INCIDENT_DAYS: i64 = 3_650;
/// Largest accepted debt-trend horizon.
pub const MAX_TREND_WEEKS: u32 = 520;

/// Full engine configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub reconcile: ReconcileConfig,
    pub scoring: ScoringConfig,
    pub correlation: CorrelationConfig,
    pub patterns: PatternConfig,
    pub hosts: HostsConfig,
    pub crash_loop: CrashLoopConfig,
    pub updates: UpdatesConfig,
    pub daemon: DaemonConfig,
    pub paths: PathsConfig,
}

/// Reconciliation pass behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Worker threads used for per-service detection.
    pub parallelism: usize,
    /// Resolve open drift for services that vanished from the desired set.
    pub resolve_undeclared: bool,
}

/// Debt score weights and ledger sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScoringConfig {
    pub critical_weight: u64,
    pub high_weight: u64,
    pub medium_weight: u64,
    pub default_weight: u64,
    pub ledger_top_n: usize,
    pub trend_weeks: u32,
}

/// Incident window and timeline caps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CorrelationConfig {
    pub margin_minutes: i64,
    pub max_events: usize,
    pub timeline_hard_cap: usize,
}

/// Incident pattern matcher limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatternConfig {
    pub default_limit: usize,
    pub max_limit: usize,
}

/// Host pressure classification thresholds (percent used).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostsConfig {
    pub warning_pct: f64,
    pub danger_pct: f64,
}

/// Crash-loop detection window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CrashLoopConfig {
    pub window_minutes: i64,
    /// Minimum start/die events inside the window to report a loop.
    pub min_events: usize,
}

/// Update risk tracker knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpdatesConfig {
    /// An incident newer than this elevates update risk by one tier.
    pub recent_incident_days: i64,
}

/// Periodic cycle scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub interval_secs: u64,
    pub tick_ms: u64,
}

/// Filesystem paths used by dlg.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub sqlite_db: PathBuf,
    pub jsonl_log: PathBuf,
    pub inbox_dir: PathBuf,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism()
                .map_or(2, |n| n.get().saturating_div(2).max(1)),
            resolve_undeclared: true,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            critical_weight: 10,
            high_weight: 5,
            medium_weight: 2,
            default_weight: 1,
            ledger_top_n: 20,
            trend_weeks: 12,
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            margin_minutes: 15,
            max_events: 200,
            timeline_hard_cap: 500,
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 50,
        }
    }
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            warning_pct: 70.0,
            danger_pct: 85.0,
        }
    }
}

impl Default for CrashLoopConfig {
    fn default() -> Self {
        Self {
            window_minutes: 60,
            min_events: 4,
        }
    }
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            recent_incident_days: 14,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval_secs: 6 * 60 * 60,
            tick_ms: 500,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[DLG-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("dlg").join("config.toml");
        let data = home_dir.join(".local").join("share").join("dlg");
        Self {
            config_file: cfg,
            sqlite_db: data.join("ledger.sqlite3"),
            jsonl_log: data.join("activity.jsonl"),
            inbox_dir: data.join("inbox"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| DlgError::Io {
                path: path_buf.clone(),
                source,
            })?;
            toml::from_str::<Self>(&raw)?
        } else if is_explicit_path {
            return Err(DlgError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut get = |name: &str| lookup(name).filter(|raw| !raw.trim().is_empty());

        if let Some(raw) = get("DLG_RECONCILE_PARALLELISM") {
            self.reconcile.parallelism = parse_env("DLG_RECONCILE_PARALLELISM", &raw)?;
        }
        if let Some(raw) = get("DLG_RECONCILE_RESOLVE_UNDECLARED") {
            self.reconcile.resolve_undeclared =
                parse_env("DLG_RECONCILE_RESOLVE_UNDECLARED", &raw)?;
        }
        if let Some(raw) = get("DLG_SCORING_LEDGER_TOP_N") {
            self.scoring.ledger_top_n = parse_env("DLG_SCORING_LEDGER_TOP_N", &raw)?;
        }
        if let Some(raw) = get("DLG_CORRELATION_MARGIN_MINUTES") {
            self.correlation.margin_minutes = parse_env("DLG_CORRELATION_MARGIN_MINUTES", &raw)?;
        }
        if let Some(raw) = get("DLG_CORRELATION_MAX_EVENTS") {
            self.correlation.max_events = parse_env("DLG_CORRELATION_MAX_EVENTS", &raw)?;
        }
        if let Some(raw) = get("DLG_HOSTS_WARNING_PCT") {
            self.hosts.warning_pct = parse_env("DLG_HOSTS_WARNING_PCT", &raw)?;
        }
        if let Some(raw) = get("DLG_HOSTS_DANGER_PCT") {
            self.hosts.danger_pct = parse_env("DLG_HOSTS_DANGER_PCT", &raw)?;
        }
        if let Some(raw) = get("DLG_UPDATES_RECENT_INCIDENT_DAYS") {
            self.updates.recent_incident_days =
                parse_env("DLG_UPDATES_RECENT_INCIDENT_DAYS", &raw)?;
        }
        if let Some(raw) = get("DLG_DAEMON_INTERVAL_SECS") {
            self.daemon.interval_secs = parse_env("DLG_DAEMON_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = get("DLG_SQLITE_DB") {
            self.paths.sqlite_db = PathBuf::from(raw);
        }
        if let Some(raw) = get("DLG_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }
        if let Some(raw) = get("DLG_INBOX_DIR") {
            self.paths.inbox_dir = PathBuf::from(raw);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.reconcile.parallelism == 0 {
            return Err(DlgError::InvalidConfig {
                details: "reconcile.parallelism must be >= 1".to_string(),
            });
        }

        let s = &self.scoring;
        if s.default_weight == 0
            || !(s.critical_weight >= s.high_weight
                && s.high_weight >= s.medium_weight
                && s.medium_weight >= s.default_weight)
        {
            return Err(DlgError::InvalidConfig {
                details: "scoring weights must be >= 1 and descend: critical >= high >= medium >= default"
                    .to_string(),
            });
        }
        if s.ledger_top_n == 0 || s.trend_weeks == 0 || s.trend_weeks > MAX_TREND_WEEKS {
            return Err(DlgError::InvalidConfig {
                details: format!(
                    "scoring.ledger_top_n must be > 0 and scoring.trend_weeks in 1..={MAX_TREND_WEEKS}"
                ),
            });
        }

        let c = &self.correlation;
        if !(0..=MAX_MARGIN_MINUTES).contains(&c.margin_minutes) {
            return Err(DlgError::InvalidConfig {
                details: format!(
                    "correlation.margin_minutes must be in 0..={MAX_MARGIN_MINUTES}, got {}",
                    c.margin_minutes
                ),
            });
        }
        if c.max_events == 0 || c.timeline_hard_cap < c.max_events {
            return Err(DlgError::InvalidConfig {
                details: "correlation.max_events must be > 0 and <= correlation.timeline_hard_cap"
                    .to_string(),
            });
        }

        if self.patterns.default_limit == 0 || self.patterns.max_limit < self.patterns.default_limit
        {
            return Err(DlgError::InvalidConfig {
                details: "patterns.default_limit must be > 0 and <= patterns.max_limit".to_string(),
            });
        }

        for (name, val) in [
            ("warning_pct", self.hosts.warning_pct),
            ("danger_pct", self.hosts.danger_pct),
        ] {
            if !(0.0..=100.0).contains(&val) {
                return Err(DlgError::InvalidConfig {
                    details: format!("hosts.{name} must be in [0, 100], got {val}"),
                });
            }
        }
        if self.hosts.warning_pct >= self.hosts.danger_pct {
            return Err(DlgError::InvalidConfig {
                details: "hosts.warning_pct must be < hosts.danger_pct".to_string(),
            });
        }

        if !(1..=MAX_CRASH_LOOP_WINDOW_MINUTES).contains(&self.crash_loop.window_minutes)
            || self.crash_loop.min_events < 2
        {
            return Err(DlgError::InvalidConfig {
                details: format!(
                    "crash_loop.window_minutes must be in 1..={MAX_CRASH_LOOP_WINDOW_MINUTES} and crash_loop.min_events >= 2"
                ),
            });
        }

        if !(0..=MAX_RECENT_INCIDENT_DAYS).contains(&self.updates.recent_incident_days) {
            return Err(DlgError::InvalidConfig {
                details: format!(
                    "updates.recent_incident_days must be in 0..={MAX_RECENT_INCIDENT_DAYS}"
                ),
            });
        }

        if self.daemon.interval_secs == 0 || self.daemon.tick_ms == 0 {
            return Err(DlgError::InvalidConfig {
                details: "daemon.interval_secs and daemon.tick_ms must be > 0".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok()
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| DlgError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}
