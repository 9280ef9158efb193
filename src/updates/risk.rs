//! Update risk tracker: staleness classification and risk tier per service.

#![allow(missing_docs)]

use std::fmt::Write as _;

use chrono::{DateTime, Duration, Utc};
use semver::Version;
use serde::Serialize;

use crate::core::config::UpdatesConfig;
use crate::core::errors::Result;
use crate::model::{RiskTier, UpdateState, UpdateStatus, VersionCheck};
use crate::store::Store;

/// Size of the jump from deployed to latest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionChange {
    None,
    Patch,
    Minor,
    Major,
    /// At least one side is not a version number (digests, `latest`, dates).
    Unknown,
}

impl VersionChange {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Patch => "patch",
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Unknown => "unknown",
        }
    }

    const fn base_risk(self) -> RiskTier {
        match self {
            Self::None | Self::Patch => RiskTier::Low,
            Self::Minor | Self::Unknown => RiskTier::Medium,
            Self::Major => RiskTier::High,
        }
    }
}

/// Lenient semver parse: strips a leading `v` and pads `1` / `1.2` to three parts.
#[must_use]
pub fn parse_version(raw: &str) -> Option<Version> {
    let s = raw.trim();
    let s = s.strip_prefix(['v', 'V']).unwrap_or(s);
    let split = s.find(['-', '+']).unwrap_or(s.len());
    let (core, suffix) = s.split_at(split);
    let padded = match core.matches('.').count() {
        0 => format!("{core}.0.0{suffix}"),
        1 => format!("{core}.0{suffix}"),
        _ => s.to_string(),
    };
    Version::parse(&padded).ok()
}

/// Status and change magnitude for one deployed/latest pair.
#[must_use]
pub fn classify(deployed: &str, latest: &str) -> (UpdateState, VersionChange) {
    let (d, l) = (deployed.trim(), latest.trim());
    match (parse_version(d), parse_version(l)) {
        (Some(dv), Some(lv)) => {
            if lv == dv {
                (UpdateState::UpToDate, VersionChange::None)
            } else if lv > dv {
                let change = if lv.major != dv.major {
                    VersionChange::Major
                } else if lv.minor != dv.minor {
                    VersionChange::Minor
                } else {
                    VersionChange::Patch
                };
                (UpdateState::UpdateAvailable, change)
            } else {
                (UpdateState::UpstreamChanges, VersionChange::Unknown)
            }
        }
        _ if d.eq_ignore_ascii_case(l) => (UpdateState::UpToDate, VersionChange::None),
        _ => (UpdateState::UpstreamChanges, VersionChange::Unknown),
    }
}

/// Risk of applying the pending change. Up-to-date services are always low;
/// an incident within the recency window raises the tier by one.
#[must_use]
pub fn risk_tier(
    status: UpdateState,
    change: VersionChange,
    last_incident: Option<DateTime<Utc>>,
    checked_at: DateTime<Utc>,
    recent_incident_days: i64,
) -> RiskTier {
    if !status.is_pending() {
        return RiskTier::Low;
    }
    let base = change.base_risk();
    let recent = last_incident
        .is_some_and(|at| at >= checked_at - Duration::days(recent_incident_days));
    if recent { base.elevated() } else { base }
}

/// Full replacement row for `check`.
#[must_use]
pub fn assess(
    check: &VersionCheck,
    last_incident: Option<DateTime<Utc>>,
    recent_incident_days: i64,
) -> UpdateStatus {
    let (status, change) = classify(&check.deployed_version, &check.latest_version);
    let risk = risk_tier(
        status,
        change,
        last_incident,
        check.checked_at,
        recent_incident_days,
    );
    let mut details = match status {
        UpdateState::UpToDate => format!("running {}", check.deployed_version),
        _ => format!(
            "{} -> {} ({})",
            check.deployed_version,
            check.latest_version,
            change.as_str()
        ),
    };
    if let Some(at) = last_incident {
        let days = (check.checked_at - at).num_days().max(0);
        let _ = write!(details, "; last incident {days}d before check");
    }
    UpdateStatus {
        service: check.service.clone(),
        deployed_version: check.deployed_version.clone(),
        latest_version: check.latest_version.clone(),
        status,
        last_checked: check.checked_at,
        last_incident,
        risk,
        details,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdatePass {
    pub checked: usize,
    pub pending: usize,
    pub statuses: Vec<UpdateStatus>,
}

/// Recompute and overwrite the update status of every service with a version check.
pub fn track_updates(store: &Store, config: &UpdatesConfig) -> Result<UpdatePass> {
    let mut pass = UpdatePass::default();
    for check in store.latest_version_checks()? {
        let last_incident = store.last_incident_for(&check.service)?;
        let status = assess(&check, last_incident, config.recent_incident_days);
        store.upsert_update_status(&status)?;
        pass.checked += 1;
        if status.status.is_pending() {
            pass.pending += 1;
        }
        pass.statuses.push(status);
    }
    Ok(pass)
}
