//! Unified timeline: stateless projection of deploy, container and incident
//! facts onto one deterministically ordered event stream.

#![allow(missing_docs)]

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::core::errors::Result;
use crate::core::time::check_range;
use crate::model::{DeployEvent, DockerEvent, EventSource, IncidentMarker, UnifiedTimelineEvent};
use crate::store::Store;

pub const INCIDENT_OPENED: &str = "incident_opened";
pub const INCIDENT_RESOLVED: &str = "incident_resolved";

/// Default number of events returned by an explicit timeline query.
pub const DEFAULT_LIMIT: usize = 200;

/// Inclusive window query with optional entity filter and row cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Case-insensitive substring matched against the event entity.
    pub entity: Option<String>,
    pub limit: usize,
}

impl TimelineQuery {
    #[must_use]
    pub fn window(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            entity: None,
            limit: DEFAULT_LIMIT,
        }
    }

    #[must_use]
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        let entity = entity.into();
        self.entity = (!entity.trim().is_empty()).then_some(entity);
        self
    }

    /// Set the cap, clamped to `1..=hard_cap`.
    #[must_use]
    pub fn with_limit(mut self, limit: usize, hard_cap: usize) -> Self {
        self.limit = limit.clamp(1, hard_cap.max(1));
        self
    }
}

/// Ordered events plus the truncation flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timeline {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub events: Vec<UnifiedTimelineEvent>,
    /// More events matched than the cap allowed.
    pub truncated: bool,
}

// ──────────────────── projection ────────────────────

#[must_use]
pub fn project_deploy(event: &DeployEvent) -> UnifiedTimelineEvent {
    UnifiedTimelineEvent {
        occurred_at: event.occurred_at,
        source: EventSource::Deploy,
        event_type: event.event_type.as_str().to_string(),
        entity: event.app.clone(),
        environment: event.environment.clone(),
        details: json!({
            "image_before": event.image_before,
            "image_after": event.image_after,
            "triggered_by": event.triggered_by,
            "job_id": event.job_id,
            "details": event.details,
        }),
        source_id: event.id,
    }
}

#[must_use]
pub fn project_docker(event: &DockerEvent) -> UnifiedTimelineEvent {
    UnifiedTimelineEvent {
        occurred_at: event.occurred_at,
        source: EventSource::Docker,
        event_type: event.event_type.clone(),
        entity: event.entity().to_string(),
        environment: None,
        details: json!({
            "container": event.container_name,
            "host": event.host,
            "exit_code": event.exit_code,
            "details": event.details,
        }),
        source_id: event.id,
    }
}

/// `incident_opened` at start, plus `incident_resolved` when resolved.
#[must_use]
pub fn project_incident(marker: &IncidentMarker) -> Vec<UnifiedTimelineEvent> {
    let entity = marker
        .affected_services
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",");
    let details = json!({
        "incident_id": marker.id,
        "title": marker.title,
        "severity": marker.severity,
    });
    let mut events = vec![UnifiedTimelineEvent {
        occurred_at: marker.started_at,
        source: EventSource::Incident,
        event_type: INCIDENT_OPENED.to_string(),
        entity: entity.clone(),
        environment: None,
        details: details.clone(),
        source_id: marker.id,
    }];
    if let Some(resolved_at) = marker.resolved_at {
        let mut details = details;
        details["root_cause"] = json!(marker.root_cause);
        details["resolution"] = json!(marker.resolution);
        events.push(UnifiedTimelineEvent {
            occurred_at: resolved_at,
            source: EventSource::Incident,
            event_type: INCIDENT_RESOLVED.to_string(),
            entity,
            environment: None,
            details,
            source_id: marker.id,
        });
    }
    events
}

fn phase(event: &UnifiedTimelineEvent) -> u8 {
    u8::from(event.event_type == INCIDENT_RESOLVED)
}

/// occurred_at, then source, then original id; an incident's opening sorts
/// before its resolution at the same instant.
fn timeline_order(a: &UnifiedTimelineEvent, b: &UnifiedTimelineEvent) -> Ordering {
    a.occurred_at
        .cmp(&b.occurred_at)
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.source_id.cmp(&b.source_id))
        .then_with(|| phase(a).cmp(&phase(b)))
}

/// Merge raw facts into the query's window. Inputs may extend beyond it.
pub fn unify(
    deploys: &[DeployEvent],
    dockers: &[DockerEvent],
    incidents: &[IncidentMarker],
    query: &TimelineQuery,
) -> Result<Timeline> {
    check_range(query.start, query.end)?;
    let needle = query.entity.as_deref().map(str::to_lowercase);

    let mut events: Vec<UnifiedTimelineEvent> = deploys
        .iter()
        .map(project_deploy)
        .chain(dockers.iter().map(project_docker))
        .chain(incidents.iter().flat_map(project_incident))
        .filter(|e| e.occurred_at >= query.start && e.occurred_at <= query.end)
        .filter(|e| {
            needle
                .as_deref()
                .is_none_or(|n| e.entity.to_lowercase().contains(n))
        })
        .collect();
    events.sort_by(timeline_order);

    let truncated = events.len() > query.limit;
    events.truncate(query.limit);
    Ok(Timeline {
        start: query.start,
        end: query.end,
        events,
        truncated,
    })
}

/// Fetch the window's raw facts from the store and unify them.
pub fn load_timeline(store: &Store, query: &TimelineQuery) -> Result<Timeline> {
    check_range(query.start, query.end)?;
    let deploys = store.deploy_events_between(query.start, query.end)?;
    let dockers = store.docker_events_between(query.start, query.end)?;
    let incidents = store.incidents_touching(query.start, query.end)?;
    unify(&deploys, &dockers, &incidents, query)
}
