//! Drift observations: the engine's one mutable, lifecycle-managed entity.

#![allow(missing_docs)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of drift categories the reconciler can detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftCategory {
    /// Running image/tag differs from the declared one.
    VersionMismatch,
    /// Domains are routed to a service that is absent, stopped, or scaled to zero.
    RouteOrphaned,
    /// Fewer replicas running than requested.
    ReplicaDeficit,
    /// Attached networks differ from the declared set.
    ConfigDrift,
}

impl DriftCategory {
    pub const ALL: [Self; 4] = [
        Self::VersionMismatch,
        Self::RouteOrphaned,
        Self::ReplicaDeficit,
        Self::ConfigDrift,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VersionMismatch => "version-mismatch",
            Self::RouteOrphaned => "route-orphaned",
            Self::ReplicaDeficit => "replica-deficit",
            Self::ConfigDrift => "config-drift",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

impl fmt::Display for DriftCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drift severity. Unknown labels fold into `Low`, which carries the default weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
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
    pub fn from_label(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" => Self::Critical,
            "high" => Self::High,
            "medium" => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted drift observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftObservation {
    pub id: i64,
    pub service_name: String,
    pub category: DriftCategory,
    pub severity: Severity,
    pub desired_value: String,
    pub actual_value: String,
    pub description: String,
    pub blast_radius: u32,
    pub first_seen_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
}

impl DriftObservation {
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// One detection emitted by the reconciler for a (service, category) key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftDetection {
    pub service_name: String,
    pub category: DriftCategory,
    pub severity: Severity,
    pub desired_value: String,
    pub actual_value: String,
    pub description: String,
    pub blast_radius: u32,
}

impl DriftDetection {
    /// Whether an open row already records exactly this discrepancy.
    #[must_use]
    pub fn matches(&self, open: &DriftObservation) -> bool {
        open.desired_value == self.desired_value
            && open.actual_value == self.actual_value
            && open.description == self.description
            && open.severity == self.severity
            && open.blast_radius == self.blast_radius
    }
}

/// Result of the keyed insert-or-update on the open drift row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Opened(DriftObservation),
    Updated(DriftObservation),
    Unchanged(DriftObservation),
}

impl UpsertOutcome {
    #[must_use]
    pub const fn observation(&self) -> &DriftObservation {
        match self {
            Self::Opened(o) | Self::Updated(o) | Self::Unchanged(o) => o,
        }
    }
}

/// Result of a resolve request on a specific row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(DriftObservation),
    /// The row was already resolved; nothing changed.
    AlreadyResolved(DriftObservation),
}
