//! Incident marker lifecycle: open, resolve, inspect.

#![allow(missing_docs)]

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::core::errors::{DlgError, Result};
use crate::core::time::{check_range, format_ts};
use crate::model::{IncidentMarker, IncidentSeverity};
use crate::store::{IncidentResolution, Store};

use super::patterns::parse_services;

/// Operator input for a new incident marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIncident {
    pub title: String,
    pub severity: IncidentSeverity,
    pub started_at: DateTime<Utc>,
    pub affected_services: BTreeSet<String>,
    pub root_cause: Option<String>,
    pub resolution: Option<String>,
}

impl NewIncident {
    /// Build from raw CLI strings. Severity must be `critical`, `warning` or
    /// `info`; services are comma-separated and at least one is required.
    pub fn from_raw(
        title: &str,
        severity: &str,
        services: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Self> {
        let severity = IncidentSeverity::parse(severity).ok_or_else(|| DlgError::InvalidQuery {
            details: format!("severity must be critical, warning or info (got {severity:?})"),
        })?;
        let new = Self {
            title: title.trim().to_string(),
            severity,
            started_at,
            affected_services: parse_services(services),
            root_cause: None,
            resolution: None,
        };
        new.validate()?;
        Ok(new)
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(DlgError::InvalidQuery {
                details: "incident title is required".to_string(),
            });
        }
        if self.affected_services.is_empty() {
            return Err(DlgError::InvalidQuery {
                details: "at least one affected service is required".to_string(),
            });
        }
        Ok(())
    }
}

/// The stored replay reference for an incident's correlated timeline.
#[must_use]
pub fn timeline_query_for(id: i64, margin_minutes: i64) -> String {
    format!("correlate {id} --margin-minutes {margin_minutes}")
}

/// Open a new incident marker and store its timeline replay reference.
pub fn create_incident(
    store: &Store,
    new: &NewIncident,
    margin_minutes: i64,
) -> Result<IncidentMarker> {
    new.validate()?;
    let mut marker = IncidentMarker {
        id: 0,
        title: new.title.clone(),
        severity: new.severity,
        started_at: new.started_at,
        resolved_at: None,
        affected_services: new.affected_services.clone(),
        root_cause: new.root_cause.clone(),
        resolution: new.resolution.clone(),
        knowledge_pack: None,
        timeline_query: None,
    };
    marker.id = store.insert_incident(&marker)?;
    let query = timeline_query_for(marker.id, margin_minutes);
    store.set_incident_timeline_query(marker.id, &query)?;
    marker.timeline_query = Some(query);
    Ok(marker)
}

/// Parse an operator-supplied knowledge pack. Only JSON objects are accepted.
pub fn parse_knowledge_pack(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).map_err(|e| DlgError::InvalidQuery {
        details: format!("knowledge pack is not valid JSON: {e}"),
    })?;
    if !value.is_object() {
        return Err(DlgError::InvalidQuery {
            details: "knowledge pack must be a JSON object".to_string(),
        });
    }
    Ok(value)
}

/// Fetch a marker or fail with `UnknownIncident`.
pub fn show_incident(store: &Store, id: i64) -> Result<IncidentMarker> {
    store.incident(id)?.ok_or(DlgError::UnknownIncident { id })
}

/// Resolve an open incident. Resolving twice is an `IncidentState` error and
/// leaves the stored marker unchanged.
pub fn resolve_incident(
    store: &Store,
    id: i64,
    root_cause: &str,
    resolution: &str,
    knowledge_pack: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<IncidentMarker> {
    if root_cause.trim().is_empty() || resolution.trim().is_empty() {
        return Err(DlgError::InvalidQuery {
            details: "root cause and resolution are both required".to_string(),
        });
    }
    if let Some(pack) = knowledge_pack
        && !pack.is_object()
    {
        return Err(DlgError::InvalidQuery {
            details: "knowledge pack must be a JSON object".to_string(),
        });
    }
    let marker = show_incident(store, id)?;
    if let Some(at) = marker.resolved_at {
        return Err(DlgError::IncidentState {
            id,
            details: format!("already resolved at {}", format_ts(at)),
        });
    }
    check_range(marker.started_at, now)?;

    let fields = IncidentResolution {
        resolved_at: now,
        root_cause: root_cause.trim(),
        resolution: resolution.trim(),
        knowledge_pack,
    };
    if !store.resolve_incident_row(id, &fields)? {
        return Err(DlgError::IncidentState {
            id,
            details: "resolved concurrently".to_string(),
        });
    }
    show_incident(store, id)
}

/// Most recent incidents first.
pub fn list_incidents(store: &Store, limit: usize) -> Result<Vec<IncidentMarker>> {
    store.recent_incidents(limit)
}
