//! Append-only deploy and container event tables, plus incident markers.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{Store, json_at, label_at, opt_json_at, opt_ts_at, to_json, ts_at};
use crate::core::errors::{DlgError, Result};
use crate::core::time::format_ts;
use crate::model::{DeployEvent, DeployEventType, DockerEvent, IncidentMarker, IncidentSeverity};

const INCIDENT_COLUMNS: &str = "id, title, severity, started_at, resolved_at, affected_services, \
     root_cause, resolution, knowledge_pack, timeline_query";

/// Fields written when an incident is resolved.
#[derive(Debug, Clone)]
pub struct IncidentResolution<'a> {
    pub resolved_at: DateTime<Utc>,
    pub root_cause: &'a str,
    pub resolution: &'a str,
    pub knowledge_pack: Option<&'a serde_json::Value>,
}

impl Store {
    // ──────────────────── deploy_events ────────────────────

    /// Append a deploy event; returns the assigned id.
    pub fn append_deploy_event(&self, event: &DeployEvent) -> Result<i64> {
        append_deploy_event(&self.conn(), event)
    }

    /// Deploy events with `start <= occurred_at <= end`, in occurrence order.
    pub fn deploy_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DeployEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, event_type, app, environment, image_before, image_after,
                    triggered_by, job_id, occurred_at, details
             FROM deploy_events
             WHERE occurred_at >= ?1 AND occurred_at <= ?2
             ORDER BY occurred_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![format_ts(start), format_ts(end)], deploy_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ──────────────────── docker_events ────────────────────

    /// Append a container event; returns the assigned id.
    pub fn append_docker_event(&self, event: &DockerEvent) -> Result<i64> {
        append_docker_event(&self.conn(), event)
    }

    /// Container events with `start <= occurred_at <= end`, in occurrence order.
    pub fn docker_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DockerEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, event_type, container_name, service, host, exit_code,
                    occurred_at, details
             FROM docker_events
             WHERE occurred_at >= ?1 AND occurred_at <= ?2
             ORDER BY occurred_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![format_ts(start), format_ts(end)], docker_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ──────────────────── incidents ────────────────────

    /// Insert a new incident marker; returns the assigned id.
    pub fn insert_incident(&self, marker: &IncidentMarker) -> Result<i64> {
        insert_incident(&self.conn(), marker)
    }

    /// Set the saved timeline query reference of an incident.
    pub fn set_incident_timeline_query(&self, id: i64, query: &str) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE incidents SET timeline_query = ?2 WHERE id = ?1",
            params![id, query],
        )?;
        if changed == 0 {
            return Err(DlgError::UnknownIncident { id });
        }
        Ok(())
    }

    /// Fetch one incident marker.
    pub fn incident(&self, id: i64) -> Result<Option<IncidentMarker>> {
        let conn = self.conn();
        let sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?1");
        Ok(conn
            .prepare_cached(&sql)?
            .query_row(params![id], incident_from_row)
            .optional()?)
    }

    /// Resolve an unresolved incident. Returns `false` when the marker was
    /// already resolved (or does not exist); nothing is written in that case.
    pub fn resolve_incident_row(&self, id: i64, fields: &IncidentResolution<'_>) -> Result<bool> {
        let changed = self
            .conn()
            .prepare_cached(
                "UPDATE incidents
                 SET resolved_at = ?2, root_cause = ?3, resolution = ?4,
                     knowledge_pack = COALESCE(?5, knowledge_pack)
                 WHERE id = ?1 AND resolved_at IS NULL",
            )?
            .execute(params![
                id,
                format_ts(fields.resolved_at),
                fields.root_cause,
                fields.resolution,
                fields.knowledge_pack.map(to_json).transpose()?,
            ])?;
        Ok(changed == 1)
    }

    /// Replace the knowledge pack of an incident.
    pub fn set_knowledge_pack(&self, id: i64, pack: &serde_json::Value) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE incidents SET knowledge_pack = ?2 WHERE id = ?1",
            params![id, to_json(pack)?],
        )?;
        if changed == 0 {
            return Err(DlgError::UnknownIncident { id });
        }
        Ok(())
    }

    /// Most recent incidents first (`started_at` desc, then id desc).
    pub fn recent_incidents(&self, limit: usize) -> Result<Vec<IncidentMarker>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents
             ORDER BY started_at DESC, id DESC LIMIT ?1"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(
                params![i64::try_from(limit).unwrap_or(i64::MAX)],
                incident_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every incident marker, most recent first.
    pub fn all_incidents(&self) -> Result<Vec<IncidentMarker>> {
        self.recent_incidents(usize::MAX)
    }

    /// Incidents that opened or resolved inside `[start, end]`.
    pub fn incidents_touching(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<IncidentMarker>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents
             WHERE (started_at >= ?1 AND started_at <= ?2)
                OR (resolved_at IS NOT NULL AND resolved_at >= ?1 AND resolved_at <= ?2)
             ORDER BY started_at ASC, id ASC"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![format_ts(start), format_ts(end)], incident_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Start time of the most recent incident affecting `service` (case-insensitive).
    pub fn last_incident_for(&self, service: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn();
        let raw: Option<String> = conn
            .prepare_cached(
                "SELECT MAX(i.started_at) FROM incidents i
                 WHERE EXISTS (
                     SELECT 1 FROM json_each(i.affected_services) s
                     WHERE lower(s.value) = lower(?1)
                 )",
            )?
            .query_row(params![service], |row| row.get(0))?;
        raw.map(|s| crate::core::time::parse_ts(&s)).transpose()
    }
}

fn deploy_from_row(row: &Row<'_>) -> rusqlite::Result<DeployEvent> {
    Ok(DeployEvent {
        id: row.get(0)?,
        event_type: label_at(row, 1, "deploy event type", DeployEventType::parse)?,
        app: row.get(2)?,
        environment: row.get(3)?,
        image_before: row.get(4)?,
        image_after: row.get(5)?,
        triggered_by: row.get(6)?,
        job_id: row.get(7)?,
        occurred_at: ts_at(row, 8)?,
        details: json_at(row, 9)?,
    })
}

fn docker_from_row(row: &Row<'_>) -> rusqlite::Result<DockerEvent> {
    Ok(DockerEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        container_name: row.get(2)?,
        service: row.get(3)?,
        host: row.get(4)?,
        exit_code: row.get(5)?,
        occurred_at: ts_at(row, 6)?,
        details: json_at(row, 7)?,
    })
}

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<IncidentMarker> {
    Ok(IncidentMarker {
        id: row.get(0)?,
        title: row.get(1)?,
        severity: label_at(row, 2, "incident severity", IncidentSeverity::parse)?,
        started_at: ts_at(row, 3)?,
        resolved_at: opt_ts_at(row, 4)?,
        affected_services: json_at(row, 5)?,
        root_cause: row.get(6)?,
        resolution: row.get(7)?,
        knowledge_pack: opt_json_at(row, 8)?,
        timeline_query: row.get(9)?,
    })
}

// ──────────────────── connection-level statements ────────────────────

pub(super) fn append_deploy_event(conn: &Connection, event: &DeployEvent) -> Result<i64> {
    conn.prepare_cached(
        "INSERT INTO deploy_events (
        event_type, app, environment, image_before, image_after,
        triggered_by, job_id, occurred_at, details
    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
    )?
    .execute(params![
        event.event_type.as_str(),
        event.app,
        event.environment,
        event.image_before,
        event.image_after,
        event.triggered_by,
        event.job_id,
        format_ts(event.occurred_at),
        to_json(&event.details)?,
    ])?;
    Ok(conn.last_insert_rowid())
}

pub(super) fn append_docker_event(conn: &Connection, event: &DockerEvent) -> Result<i64> {
    conn.prepare_cached(
        "INSERT INTO docker_events (
        event_type, container_name, service, host, exit_code, occurred_at, details
    ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
    )?
    .execute(params![
        event.event_type,
        event.container_name,
        event.service,
        event.host,
        event.exit_code,
        format_ts(event.occurred_at),
        to_json(&event.details)?,
    ])?;
    Ok(conn.last_insert_rowid())
}

pub(super) fn insert_incident(conn: &Connection, marker: &IncidentMarker) -> Result<i64> {
    conn.prepare_cached(
        "INSERT INTO incidents (
        title, severity, started_at, resolved_at, affected_services,
        root_cause, resolution, knowledge_pack, timeline_query
    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
    )?
    .execute(params![
        marker.title,
        marker.severity.as_str(),
        format_ts(marker.started_at),
        marker.resolved_at.map(format_ts),
        to_json(&marker.affected_services)?,
        marker.root_cause,
        marker.resolution,
        marker.knowledge_pack.as_ref().map(to_json).transpose()?,
        marker.timeline_query,
    ])?;
    Ok(conn.last_insert_rowid())
}
