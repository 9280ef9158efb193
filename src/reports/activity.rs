//! Deploy velocity and crash-loop detection over recent events.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::core::config::CrashLoopConfig;
use crate::core::errors::Result;
use crate::core::time::window_start;
use crate::model::{DeployEvent, DeployEventType, DockerEvent};
use crate::store::Store;

// ──────────────────── deploy velocity ────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployDay {
    pub day: NaiveDate,
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// `succeeded / (succeeded + failed)` as a percentage; absent with no outcomes.
    pub success_pct: Option<f64>,
}

/// Per-day deploy counts, oldest day first. Days without events are omitted.
#[must_use]
pub fn deploy_velocity(events: &[DeployEvent]) -> Vec<DeployDay> {
    let mut days: BTreeMap<NaiveDate, (usize, usize, usize)> = BTreeMap::new();
    for event in events {
        let counts = days.entry(event.occurred_at.date_naive()).or_default();
        match event.event_type {
            DeployEventType::Started => counts.0 += 1,
            DeployEventType::Succeeded => counts.1 += 1,
            DeployEventType::Failed => counts.2 += 1,
        }
    }
    days.into_iter()
        .map(|(day, (started, succeeded, failed))| {
            let finished = succeeded + failed;
            #[allow(clippy::cast_precision_loss)]
            let success_pct =
                (finished > 0).then(|| succeeded as f64 * 100.0 / finished as f64);
            DeployDay {
                day,
                started,
                succeeded,
                failed,
                success_pct,
            }
        })
        .collect()
}

pub fn load_deploy_velocity(
    store: &Store,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<DeployDay>> {
    let since = window_start(now, window)?;
    Ok(deploy_velocity(&store.deploy_events_between(since, now)?))
}

// ──────────────────── crash loops ────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrashLoop {
    pub entity: String,
    pub host: String,
    pub restart_count: usize,
    pub first_event: DateTime<Utc>,
    pub last_event: DateTime<Utc>,
    pub span_minutes: f64,
}

/// Entities with at least `min_events` start/die events in the trailing
/// window ending at `now`. Most restarts first.
#[must_use]
pub fn crash_loops(
    events: &[DockerEvent],
    config: &CrashLoopConfig,
    now: DateTime<Utc>,
) -> Vec<CrashLoop> {
    let since = now - Duration::minutes(config.window_minutes);
    let mut groups: BTreeMap<(&str, &str), Vec<DateTime<Utc>>> = BTreeMap::new();
    for event in events
        .iter()
        .filter(|e| e.is_churn() && e.occurred_at >= since && e.occurred_at <= now)
    {
        groups
            .entry((event.entity(), event.host.as_str()))
            .or_default()
            .push(event.occurred_at);
    }
    let mut loops: Vec<CrashLoop> = groups
        .into_iter()
        .filter(|(_, times)| times.len() >= config.min_events)
        .filter_map(|((entity, host), times)| {
            let first_event = *times.iter().min()?;
            let last_event = *times.iter().max()?;
            #[allow(clippy::cast_precision_loss)]
            let span_minutes = (last_event - first_event).num_seconds() as f64 / 60.0;
            Some(CrashLoop {
                entity: entity.to_string(),
                host: host.to_string(),
                restart_count: times.len(),
                first_event,
                last_event,
                span_minutes,
            })
        })
        .collect();
    loops.sort_by(|a, b| {
        b.restart_count
            .cmp(&a.restart_count)
            .then_with(|| a.entity.cmp(&b.entity))
            .then_with(|| a.host.cmp(&b.host))
    });
    loops
}

pub fn load_crash_loops(
    store: &Store,
    config: &CrashLoopConfig,
    now: DateTime<Utc>,
) -> Result<Vec<CrashLoop>> {
    let since = now - Duration::minutes(config.window_minutes);
    Ok(crash_loops(&store.docker_events_between(since, now)?, config, now))
}
