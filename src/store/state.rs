//! Desired specs, observed state, host snapshots, version checks and update status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};

use super::{Store, json_at, label_at, opt_ts_at, to_json, ts_at};
use crate::core::errors::Result;
use crate::core::time::format_ts;
use crate::model::{
    DesiredServiceSpec, ObservedServiceState, RiskTier, StateSnapshot, UpdateState, UpdateStatus,
    VersionCheck,
};

impl Store {
    // ──────────────────── desired_specs ────────────────────

    pub fn insert_desired_spec(&self, spec: &DesiredServiceSpec) -> Result<i64> {
        insert_desired_spec(&self.conn(), spec)
    }

    /// The current desired set: rows from the latest load of each source file.
    ///
    /// A service declared by several sources resolves to the most recently
    /// loaded declaration. Result is ordered by service name.
    pub fn current_desired_specs(&self) -> Result<Vec<DesiredServiceSpec>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT d.app, d.service, d.environment, d.image, d.tag, d.domains, d.labels,
                    d.volumes, d.networks, d.source_file, d.loaded_at
             FROM desired_specs d
             WHERE d.loaded_at = (
                 SELECT MAX(d2.loaded_at) FROM desired_specs d2
                 WHERE d2.source_file = d.source_file
             )
             ORDER BY d.loaded_at ASC, d.id ASC",
        )?;
        let rows = stmt
            .query_map([], desired_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut by_service: BTreeMap<String, DesiredServiceSpec> = BTreeMap::new();
        for spec in rows {
            by_service.insert(spec.service.clone(), spec);
        }
        Ok(by_service.into_values().collect())
    }

    // ──────────────────── observed_states ────────────────────

    pub fn insert_observed_state(&self, state: &ObservedServiceState) -> Result<i64> {
        insert_observed_state(&self.conn(), state)
    }

    /// Current observed state: for every host, the rows of its most recent
    /// snapshot batch. A service missing from that batch is absent.
    pub fn current_observed_states(&self) -> Result<Vec<ObservedServiceState>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT o.service, o.host, o.container_name, o.image, o.tag, o.replicas, o.state,
                    o.ports, o.networks, o.created_at, o.observed_at, o.snapshot_id
             FROM observed_states o
             WHERE o.snapshot_id = (
                 SELECT o2.snapshot_id FROM observed_states o2
                 WHERE o2.host = o.host
                 ORDER BY o2.observed_at DESC, o2.id DESC
                 LIMIT 1
             )
             ORDER BY o.service ASC, o.host ASC, o.id ASC",
        )?;
        let rows = stmt
            .query_map([], observed_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ──────────────────── state_snapshots ────────────────────

    /// Append a host snapshot. Returns `false` if `(snapshot_id, host)` already exists.
    pub fn insert_snapshot(&self, snapshot: &StateSnapshot) -> Result<bool> {
        insert_snapshot(&self.conn(), snapshot)
    }

    /// The newest snapshot of every host, ordered by host.
    pub fn latest_snapshots(&self) -> Result<Vec<StateSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT s.snapshot_id, s.host, s.disk_usage_pct, s.memory_usage_pct,
                    s.service_count, s.container_count, s.captured_at, s.payload
             FROM state_snapshots s
             WHERE s.id = (
                 SELECT s2.id FROM state_snapshots s2
                 WHERE s2.host = s.host
                 ORDER BY s2.captured_at DESC, s2.id DESC
                 LIMIT 1
             )
             ORDER BY s.host ASC",
        )?;
        let rows = stmt
            .query_map([], snapshot_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Snapshots captured at or after `since`, oldest first.
    pub fn snapshots_since(&self, since: DateTime<Utc>) -> Result<Vec<StateSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT snapshot_id, host, disk_usage_pct, memory_usage_pct, service_count,
                    container_count, captured_at, payload
             FROM state_snapshots
             WHERE captured_at >= ?1
             ORDER BY captured_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![format_ts(since)], snapshot_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ──────────────────── version_checks ────────────────────

    pub fn insert_version_check(&self, check: &VersionCheck) -> Result<()> {
        insert_version_check(&self.conn(), check)
    }

    /// The newest version check of every service, ordered by service.
    pub fn latest_version_checks(&self) -> Result<Vec<VersionCheck>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT v.service, v.deployed_version, v.latest_version, v.checked_at
             FROM version_checks v
             WHERE v.id = (
                 SELECT v2.id FROM version_checks v2
                 WHERE v2.service = v.service
                 ORDER BY v2.checked_at DESC, v2.id DESC
                 LIMIT 1
             )
             ORDER BY v.service ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(VersionCheck {
                    service: row.get(0)?,
                    deployed_version: row.get(1)?,
                    latest_version: row.get(2)?,
                    checked_at: ts_at(row, 3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ──────────────────── update_status ────────────────────

    /// Overwrite the service's update-status row.
    pub fn upsert_update_status(&self, status: &UpdateStatus) -> Result<()> {
        self.conn()
            .prepare_cached(
                "INSERT OR REPLACE INTO update_status (
                service, deployed_version, latest_version, status, last_checked,
                last_incident, risk, details
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            )?
            .execute(params![
                status.service,
                status.deployed_version,
                status.latest_version,
                status.status.as_str(),
                format_ts(status.last_checked),
                status.last_incident.map(format_ts),
                status.risk.as_str(),
                status.details,
            ])?;
        Ok(())
    }

    /// All update-status rows, least recently checked first.
    pub fn update_statuses(&self) -> Result<Vec<UpdateStatus>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT service, deployed_version, latest_version, status, last_checked,
                    last_incident, risk, details
             FROM update_status
             ORDER BY last_checked ASC, service ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UpdateStatus {
                    service: row.get(0)?,
                    deployed_version: row.get(1)?,
                    latest_version: row.get(2)?,
                    status: label_at(row, 3, "update status", UpdateState::parse)?,
                    last_checked: ts_at(row, 4)?,
                    last_incident: opt_ts_at(row, 5)?,
                    risk: label_at(row, 6, "risk tier", RiskTier::parse)?,
                    details: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn desired_from_row(row: &Row<'_>) -> rusqlite::Result<DesiredServiceSpec> {
    Ok(DesiredServiceSpec {
        app: row.get(0)?,
        service: row.get(1)?,
        environment: row.get(2)?,
        image: row.get(3)?,
        tag: row.get(4)?,
        domains: json_at(row, 5)?,
        labels: json_at(row, 6)?,
        volumes: json_at(row, 7)?,
        networks: json_at(row, 8)?,
        source_file: row.get(9)?,
        loaded_at: ts_at(row, 10)?,
    })
}

fn observed_from_row(row: &Row<'_>) -> rusqlite::Result<ObservedServiceState> {
    Ok(ObservedServiceState {
        service: row.get(0)?,
        host: row.get(1)?,
        container_name: row.get(2)?,
        image: row.get(3)?,
        tag: row.get(4)?,
        replicas: row.get(5)?,
        state: row.get(6)?,
        ports: json_at(row, 7)?,
        networks: json_at(row, 8)?,
        created_at: opt_ts_at(row, 9)?,
        observed_at: ts_at(row, 10)?,
        snapshot_id: row.get(11)?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<StateSnapshot> {
    Ok(StateSnapshot {
        snapshot_id: row.get(0)?,
        host: row.get(1)?,
        disk_usage_pct: row.get(2)?,
        memory_usage_pct: row.get(3)?,
        service_count: row.get(4)?,
        container_count: row.get(5)?,
        captured_at: ts_at(row, 6)?,
        payload: json_at(row, 7)?,
    })
}

// ──────────────────── connection-level statements ────────────────────

pub(super) fn insert_desired_spec(conn: &Connection, spec: &DesiredServiceSpec) -> Result<i64> {
    conn.prepare_cached(
        "INSERT INTO desired_specs (
        app, service, environment, image, tag, domains, labels, volumes,
        networks, source_file, loaded_at
    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
    )?
    .execute(params![
        spec.app,
        spec.service,
        spec.environment,
        spec.image,
        spec.tag,
        to_json(&spec.domains)?,
        to_json(&spec.labels)?,
        to_json(&spec.volumes)?,
        to_json(&spec.networks)?,
        spec.source_file,
        format_ts(spec.loaded_at),
    ])?;
    Ok(conn.last_insert_rowid())
}

pub(super) fn insert_observed_state(
    conn: &Connection,
    state: &ObservedServiceState,
) -> Result<i64> {
    conn.prepare_cached(
        "INSERT INTO observed_states (
        service, host, container_name, image, tag, replicas, state, ports,
        networks, created_at, observed_at, snapshot_id
    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
    )?
    .execute(params![
        state.service,
        state.host,
        state.container_name,
        state.image,
        state.tag,
        state.replicas,
        state.state,
        to_json(&state.ports)?,
        to_json(&state.networks)?,
        state.created_at.map(format_ts),
        format_ts(state.observed_at),
        state.snapshot_id,
    ])?;
    Ok(conn.last_insert_rowid())
}

pub(super) fn insert_snapshot(conn: &Connection, snapshot: &StateSnapshot) -> Result<bool> {
    let changed = conn
        .prepare_cached(
            "INSERT OR IGNORE INTO state_snapshots (
            snapshot_id, host, disk_usage_pct, memory_usage_pct, service_count,
            container_count, captured_at, payload
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        )?
        .execute(params![
            snapshot.snapshot_id,
            snapshot.host,
            snapshot.disk_usage_pct,
            snapshot.memory_usage_pct,
            snapshot.service_count,
            snapshot.container_count,
            format_ts(snapshot.captured_at),
            to_json(&snapshot.payload)?,
        ])?;
    Ok(changed == 1)
}

pub(super) fn insert_version_check(conn: &Connection, check: &VersionCheck) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO version_checks (
        service, deployed_version, latest_version, checked_at
    ) VALUES (?1,?2,?3,?4)",
    )?
    .execute(params![
        check.service,
        check.deployed_version,
        check.latest_version,
        format_ts(check.checked_at),
    ])?;
    Ok(())
}
