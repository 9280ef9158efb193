//! Desired and observed service state, host snapshots, and version tracking rows.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{DlgError, Result};

static REPLICA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*(?:/\s*(\d+)\s*)?$").unwrap_or_else(|e| panic!("replica regex: {e}"))
});

/// One load of a declared service definition. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredServiceSpec {
    pub app: String,
    pub service: String,
    pub environment: String,
    pub image: String,
    pub tag: String,
    #[serde(default)]
    pub domains: BTreeSet<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub networks: BTreeSet<String>,
    pub source_file: String,
    pub loaded_at: DateTime<Utc>,
}

impl DesiredServiceSpec {
    /// `image:tag` as declared.
    #[must_use]
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("service", &self.service),
            ("image", &self.image),
            ("tag", &self.tag),
            ("source_file", &self.source_file),
        ] {
            if value.trim().is_empty() {
                return Err(DlgError::MalformedSnapshot {
                    service: self.service.clone(),
                    details: format!("desired spec has empty {field}"),
                });
            }
        }
        Ok(())
    }
}

/// A point-in-time report for one service on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedServiceState {
    pub service: String,
    pub host: String,
    #[serde(default)]
    pub container_name: Option<String>,
    pub image: String,
    pub tag: String,
    pub replicas: String,
    pub state: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub networks: BTreeSet<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    pub snapshot_id: String,
}

/// Parsed `running/desired` replica string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaCount {
    pub running: u32,
    pub desired: u32,
}

impl ObservedServiceState {
    #[must_use]
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.trim().eq_ignore_ascii_case("running")
    }

    /// Parse the replica string. `"2/3"` is two of three; a bare `"3"` means three of three.
    pub fn replica_count(&self) -> Result<ReplicaCount> {
        let caps = REPLICA_RE
            .captures(&self.replicas)
            .ok_or_else(|| DlgError::MalformedSnapshot {
                service: self.service.clone(),
                details: format!(
                    "unparseable replica string {:?} on host {}",
                    self.replicas, self.host
                ),
            })?;
        let parse = |s: &str| {
            s.parse::<u32>().map_err(|e| DlgError::MalformedSnapshot {
                service: self.service.clone(),
                details: format!("replica count {s:?}: {e}"),
            })
        };
        let running = parse(&caps[1])?;
        let desired = match caps.get(2) {
            Some(m) => parse(m.as_str())?,
            None => running,
        };
        Ok(ReplicaCount { running, desired })
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("service", &self.service),
            ("host", &self.host),
            ("image", &self.image),
            ("snapshot_id", &self.snapshot_id),
        ] {
            if value.trim().is_empty() {
                return Err(DlgError::MalformedSnapshot {
                    service: self.service.clone(),
                    details: format!("observed state has empty {field}"),
                });
            }
        }
        Ok(())
    }
}

/// Per-host resource metrics captured at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub snapshot_id: String,
    pub host: String,
    pub disk_usage_pct: f64,
    pub memory_usage_pct: f64,
    #[serde(default)]
    pub service_count: u32,
    #[serde(default)]
    pub container_count: u32,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl StateSnapshot {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("disk_usage_pct", self.disk_usage_pct),
            ("memory_usage_pct", self.memory_usage_pct),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(DlgError::MalformedSnapshot {
                    service: self.host.clone(),
                    details: format!("{field} out of range: {value}"),
                });
            }
        }
        if self.snapshot_id.trim().is_empty() || self.host.trim().is_empty() {
            return Err(DlgError::MalformedSnapshot {
                service: self.host.clone(),
                details: "snapshot requires snapshot_id and host".to_string(),
            });
        }
        Ok(())
    }
}

/// Collector-supplied version facts for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionCheck {
    pub service: String,
    pub deployed_version: String,
    pub latest_version: String,
    pub checked_at: DateTime<Utc>,
}

/// Staleness classification of a service's deployed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateState {
    #[serde(rename = "up to date")]
    UpToDate,
    #[serde(rename = "UPDATE AVAILABLE")]
    UpdateAvailable,
    #[serde(rename = "UPSTREAM CHANGES")]
    UpstreamChanges,
}

impl UpdateState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UpToDate => "up to date",
            Self::UpdateAvailable => "UPDATE AVAILABLE",
            Self::UpstreamChanges => "UPSTREAM CHANGES",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        [Self::UpToDate, Self::UpdateAvailable, Self::UpstreamChanges]
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    #[must_use]
    pub const fn is_pending(self) -> bool {
        !matches!(self, Self::UpToDate)
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualitative risk of applying a pending update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        [Self::Low, Self::Medium, Self::High, Self::Critical]
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    /// One tier up, saturating at `Critical`.
    #[must_use]
    pub const fn elevated(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single current version-tracking row for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub service: String,
    pub deployed_version: String,
    pub latest_version: String,
    pub status: UpdateState,
    pub last_checked: DateTime<Utc>,
    pub last_incident: Option<DateTime<Utc>>,
    pub risk: RiskTier,
    pub details: String,
}
