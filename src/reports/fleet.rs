//! Fleet-wide reports over declared and observed services: version
//! triangulation, orphaned routes, the dependency map and the update backlog.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::core::errors::Result;
use crate::model::{
    DesiredServiceSpec, DriftCategory, DriftObservation, ObservedServiceState, UpdateStatus,
    VersionCheck,
};
use crate::reconcile::blast_radii;
use crate::store::{DriftFilter, Store};

// ──────────────────── triangulation ────────────────────

/// Desired, actual and latest-known versions of one service side by side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriangulationRow {
    pub service: String,
    pub desired: Option<String>,
    /// Distinct image refs running across hosts; empty when absent.
    pub actual: BTreeSet<String>,
    pub latest: Option<String>,
    pub hosts: BTreeSet<String>,
    /// Desired declared and every observed row runs exactly that image.
    pub in_sync: bool,
}

fn row_for<'a>(
    rows: &'a mut BTreeMap<String, TriangulationRow>,
    service: &str,
) -> &'a mut TriangulationRow {
    rows.entry(service.to_string())
        .or_insert_with(|| TriangulationRow {
            service: service.to_string(),
            desired: None,
            actual: BTreeSet::new(),
            latest: None,
            hosts: BTreeSet::new(),
            in_sync: false,
        })
}

#[must_use]
pub fn triangulate(
    desired: &[DesiredServiceSpec],
    observed: &[ObservedServiceState],
    checks: &[VersionCheck],
) -> Vec<TriangulationRow> {
    let mut rows: BTreeMap<String, TriangulationRow> = BTreeMap::new();
    for spec in desired {
        row_for(&mut rows, &spec.service).desired = Some(spec.image_ref());
    }
    for obs in observed {
        let row = row_for(&mut rows, &obs.service);
        row.actual.insert(obs.image_ref());
        row.hosts.insert(obs.host.clone());
    }
    for check in checks {
        if let Some(row) = rows.get_mut(&check.service) {
            row.latest = Some(check.latest_version.clone());
        }
    }
    rows.into_values()
        .map(|mut row| {
            row.in_sync = row
                .desired
                .as_ref()
                .is_some_and(|d| row.actual.len() == 1 && row.actual.contains(d));
            row
        })
        .collect()
}

pub fn load_triangulation(store: &Store) -> Result<Vec<TriangulationRow>> {
    Ok(triangulate(
        &store.current_desired_specs()?,
        &store.current_observed_states()?,
        &store.latest_version_checks()?,
    ))
}

// ──────────────────── orphaned routes ────────────────────

/// A public domain whose backing service is not serving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedRoute {
    pub domain: String,
    pub service: String,
    pub actual: String,
    pub drift_id: i64,
    pub first_seen_at: chrono::DateTime<chrono::Utc>,
}

/// One line per domain of every service with open `route-orphaned` drift.
#[must_use]
pub fn orphaned_routes(
    open_drift: &[DriftObservation],
    desired: &[DesiredServiceSpec],
) -> Vec<OrphanedRoute> {
    let domains: BTreeMap<&str, &BTreeSet<String>> = desired
        .iter()
        .map(|s| (s.service.as_str(), &s.domains))
        .collect();
    let mut routes: Vec<OrphanedRoute> = open_drift
        .iter()
        .filter(|o| o.is_open() && o.category == DriftCategory::RouteOrphaned)
        .flat_map(|o| {
            domains
                .get(o.service_name.as_str())
                .into_iter()
                .flat_map(|set| set.iter())
                .map(move |domain| OrphanedRoute {
                    domain: domain.clone(),
                    service: o.service_name.clone(),
                    actual: o.actual_value.clone(),
                    drift_id: o.id,
                    first_seen_at: o.first_seen_at,
                })
        })
        .collect();
    routes.sort_by(|a, b| a.domain.cmp(&b.domain).then(a.drift_id.cmp(&b.drift_id)));
    routes
}

pub fn load_orphaned_routes(store: &Store) -> Result<Vec<OrphanedRoute>> {
    let open = store.list_drift(&DriftFilter {
        category: Some(DriftCategory::RouteOrphaned),
        ..DriftFilter::default()
    })?;
    Ok(orphaned_routes(&open, &store.current_desired_specs()?))
}

// ──────────────────── dependency map ────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDependencies {
    pub service: String,
    pub networks: BTreeSet<String>,
    /// Other declared services sharing at least one network.
    pub shares_with: BTreeSet<String>,
    pub blast_radius: u32,
}

#[must_use]
pub fn dependency_map(desired: &[DesiredServiceSpec]) -> Vec<ServiceDependencies> {
    let radii = blast_radii(desired);
    let mut map: Vec<ServiceDependencies> = desired
        .iter()
        .map(|spec| ServiceDependencies {
            service: spec.service.clone(),
            networks: spec.networks.clone(),
            shares_with: desired
                .iter()
                .filter(|o| o.service != spec.service && !o.networks.is_disjoint(&spec.networks))
                .map(|o| o.service.clone())
                .collect(),
            blast_radius: radii.get(&spec.service).copied().unwrap_or(1),
        })
        .collect();
    map.sort_by(|a, b| {
        b.blast_radius
            .cmp(&a.blast_radius)
            .then_with(|| a.service.cmp(&b.service))
    });
    map
}

pub fn load_dependency_map(store: &Store) -> Result<Vec<ServiceDependencies>> {
    Ok(dependency_map(&store.current_desired_specs()?))
}

// ──────────────────── update backlog ────────────────────

/// Services with a pending update, oldest check first.
#[must_use]
pub fn update_backlog(statuses: Vec<UpdateStatus>) -> Vec<UpdateStatus> {
    let mut pending: Vec<UpdateStatus> = statuses
        .into_iter()
        .filter(|s| s.status.is_pending())
        .collect();
    pending.sort_by(|a, b| {
        a.last_checked
            .cmp(&b.last_checked)
            .then_with(|| a.service.cmp(&b.service))
    });
    pending
}

pub fn load_update_backlog(store: &Store) -> Result<Vec<UpdateStatus>> {
    Ok(update_backlog(store.update_statuses()?))
}
