//! Host pressure and the platform health composite.

#![allow(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::core::config::HostsConfig;
use crate::core::errors::Result;
use crate::model::{DockerEvent, ObservedServiceState, StateSnapshot, UpdateStatus};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Healthy,
    Warning,
    Danger,
}

impl PressureLevel {
    /// Classify the worse of disk and memory usage against the thresholds.
    #[must_use]
    pub fn classify(disk_pct: f64, memory_pct: f64, config: &HostsConfig) -> Self {
        let worst = disk_pct.max(memory_pct);
        if worst >= config.danger_pct {
            Self::Danger
        } else if worst >= config.warning_pct {
            Self::Warning
        } else {
            Self::Healthy
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Danger => "danger",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostPressure {
    pub host: String,
    pub disk_usage_pct: f64,
    pub memory_usage_pct: f64,
    pub level: PressureLevel,
    pub captured_at: DateTime<Utc>,
}

/// Pressure of each host's latest snapshot, worst first.
#[must_use]
pub fn host_pressure(latest: &[StateSnapshot], config: &HostsConfig) -> Vec<HostPressure> {
    let mut hosts: Vec<HostPressure> = latest
        .iter()
        .map(|s| HostPressure {
            host: s.host.clone(),
            disk_usage_pct: s.disk_usage_pct,
            memory_usage_pct: s.memory_usage_pct,
            level: PressureLevel::classify(s.disk_usage_pct, s.memory_usage_pct, config),
            captured_at: s.captured_at,
        })
        .collect();
    hosts.sort_by(|a, b| b.level.cmp(&a.level).then_with(|| a.host.cmp(&b.host)));
    hosts
}

pub fn load_host_pressure(store: &Store, config: &HostsConfig) -> Result<Vec<HostPressure>> {
    Ok(host_pressure(&store.latest_snapshots()?, config))
}

// ──────────────────── platform health ────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformHealth {
    pub generated_at: DateTime<Utc>,
    pub active_drift: usize,
    pub oom_events_24h: usize,
    pub pending_updates: usize,
    /// Mean disk usage over every snapshot of the last 24 hours.
    pub avg_disk_pct_24h: Option<f64>,
    /// Services whose current observed state is not running.
    pub degraded_services: Vec<String>,
}

/// Inputs gathered for [`platform_health`].
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    pub active_drift: usize,
    pub docker_events_24h: Vec<DockerEvent>,
    pub update_statuses: Vec<UpdateStatus>,
    pub snapshots_24h: Vec<StateSnapshot>,
    pub observed: Vec<ObservedServiceState>,
}

#[must_use]
pub fn platform_health(inputs: &HealthInputs, now: DateTime<Utc>) -> PlatformHealth {
    let oom_events_24h = inputs
        .docker_events_24h
        .iter()
        .filter(|e| e.is_oom())
        .count();
    let avg_disk_pct_24h = if inputs.snapshots_24h.is_empty() {
        None
    } else {
        let total: f64 = inputs.snapshots_24h.iter().map(|s| s.disk_usage_pct).sum();
        #[allow(clippy::cast_precision_loss)]
        Some(total / inputs.snapshots_24h.len() as f64)
    };
    let mut degraded_services: Vec<String> = inputs
        .observed
        .iter()
        .filter(|o| !o.is_running())
        .map(|o| o.service.clone())
        .collect();
    degraded_services.sort();
    degraded_services.dedup();

    PlatformHealth {
        generated_at: now,
        active_drift: inputs.active_drift,
        oom_events_24h,
        pending_updates: inputs
            .update_statuses
            .iter()
            .filter(|s| s.status.is_pending())
            .count(),
        avg_disk_pct_24h,
        degraded_services,
    }
}

pub fn load_platform_health(store: &Store, now: DateTime<Utc>) -> Result<PlatformHealth> {
    let since = now - Duration::hours(24);
    let inputs = HealthInputs {
        active_drift: store.open_drift()?.len(),
        docker_events_24h: store.docker_events_between(since, now)?,
        update_statuses: store.update_statuses()?,
        snapshots_24h: store.snapshots_since(since)?,
        observed: store.current_observed_states()?,
    };
    Ok(platform_health(&inputs, now))
}
