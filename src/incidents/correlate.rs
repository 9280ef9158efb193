//! Incident correlation: the unified timeline around an incident marker.

#![allow(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::core::config::CorrelationConfig;
use crate::core::errors::{DlgError, Result};
use crate::model::{DeployEvent, DockerEvent, IncidentMarker};
use crate::store::Store;
use crate::timeline::{Timeline, TimelineQuery, load_timeline, unify};

/// `[started_at - margin, (resolved_at or now) + margin]`.
///
/// A margin that pushes either edge outside the representable range is a
/// query rejection.
pub fn incident_window(
    marker: &IncidentMarker,
    margin_minutes: i64,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let out_of_range = || DlgError::InvalidQuery {
        details: format!("correlation margin of {margin_minutes} minutes is out of range"),
    };
    if margin_minutes < 0 {
        return Err(DlgError::InvalidQuery {
            details: format!("correlation margin must not be negative, got {margin_minutes}"),
        });
    }
    let margin = Duration::try_minutes(margin_minutes).ok_or_else(out_of_range)?;
    let upper = marker.resolved_at.unwrap_or(now).max(marker.started_at);
    let start = marker
        .started_at
        .checked_sub_signed(margin)
        .ok_or_else(out_of_range)?;
    let end = upper.checked_add_signed(margin).ok_or_else(out_of_range)?;
    Ok((start, end))
}

/// An incident with its surrounding events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Correlation {
    pub incident: IncidentMarker,
    pub margin_minutes: i64,
    pub timeline: Timeline,
}

/// Pure form of [`correlate_incident`] over pre-fetched facts.
pub fn correlate_events(
    marker: &IncidentMarker,
    deploys: &[DeployEvent],
    dockers: &[DockerEvent],
    incidents: &[IncidentMarker],
    config: &CorrelationConfig,
    now: DateTime<Utc>,
) -> Result<Correlation> {
    let (start, end) = incident_window(marker, config.margin_minutes, now)?;
    let query = TimelineQuery::window(start, end).with_limit(config.max_events, config.max_events);
    Ok(Correlation {
        incident: marker.clone(),
        margin_minutes: config.margin_minutes,
        timeline: unify(deploys, dockers, incidents, &query)?,
    })
}

/// Correlate everything around incident `id`. No entity filter is applied.
pub fn correlate_incident(
    store: &Store,
    id: i64,
    config: &CorrelationConfig,
    now: DateTime<Utc>,
) -> Result<Correlation> {
    let marker = store
        .incident(id)?
        .ok_or(DlgError::UnknownIncident { id })?;
    let (start, end) = incident_window(&marker, config.margin_minutes, now)?;
    let query = TimelineQuery::window(start, end).with_limit(config.max_events, config.max_events);
    Ok(Correlation {
        incident: marker,
        margin_minutes: config.margin_minutes,
        timeline: load_timeline(store, &query)?,
    })
}

/// Correlate an explicit window. The window is used as given, without margin.
pub fn correlate_window(
    store: &Store,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    config: &CorrelationConfig,
) -> Result<Timeline> {
    let query = TimelineQuery::window(start, end).with_limit(config.max_events, config.max_events);
    load_timeline(store, &query)
}
