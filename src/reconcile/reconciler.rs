//! Reconciliation pass: fan per-service detection out over a worker pool and
//! apply each verdict to the drift table through the keyed upsert.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use chrono::{DateTime, Utc};
use crossbeam_channel as channel;
use serde::Serialize;

use super::detect::{Verdict, assess_service, blast_radii};
use crate::core::config::ReconcileConfig;
use crate::core::errors::{DlgError, Result};
use crate::model::{DesiredServiceSpec, DriftObservation, ObservedServiceState, UpsertOutcome};
use crate::store::Store;

/// Resolution text for drift whose condition no longer reproduces.
pub const RESOLUTION_CLEARED: &str = "condition cleared";
/// Resolution text for drift on a service that left the desired set.
pub const RESOLUTION_UNDECLARED: &str = "service no longer declared";

/// A service whose detection failed; the pass continued without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceFailure {
    pub service: String,
    pub code: &'static str,
    pub details: String,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub services_checked: usize,
    pub opened: Vec<DriftObservation>,
    pub updated: Vec<DriftObservation>,
    pub resolved: Vec<DriftObservation>,
    pub unchanged: usize,
    pub failures: Vec<ServiceFailure>,
}

impl ReconcileReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Per-service result sent back from a worker.
#[derive(Debug, Default)]
struct ServiceOutcome {
    opened: Vec<DriftObservation>,
    updated: Vec<DriftObservation>,
    resolved: Vec<DriftObservation>,
    unchanged: usize,
}

/// Diffs desired against observed state and maintains the drift lifecycle.
pub struct Reconciler<'a> {
    store: &'a Store,
    config: ReconcileConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a Store, config: ReconcileConfig) -> Self {
        Self { store, config }
    }

    /// Run one pass against the store's current desired and observed state.
    ///
    /// Per-service failures are isolated into the report. A broken drift
    /// uniqueness invariant aborts the pass with an error.
    pub fn run(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        if let Some(dup) = self.store.audit_open_drift()?.into_iter().next() {
            return Err(DlgError::DuplicateOpenDrift {
                service: dup.service_name,
                category: dup.category,
                open_rows: dup.open_rows,
            });
        }

        let desired = self.store.current_desired_specs()?;
        let mut observed: BTreeMap<String, Vec<ObservedServiceState>> = BTreeMap::new();
        for row in self.store.current_observed_states()? {
            observed.entry(row.service.clone()).or_default().push(row);
        }
        let radii = blast_radii(&desired);

        let mut report = self.fan_out(&desired, &observed, &radii, now)?;

        if self.config.resolve_undeclared {
            let declared: BTreeSet<&str> = desired.iter().map(|s| s.service.as_str()).collect();
            for open in self.store.open_drift()? {
                if declared.contains(open.service_name.as_str()) {
                    continue;
                }
                if let Some(row) = self.store.resolve_open_drift(
                    &open.service_name,
                    open.category,
                    RESOLUTION_UNDECLARED,
                    now,
                )? {
                    report.resolved.push(row);
                }
            }
        }

        report.opened.sort_by_key(|o| o.id);
        report.updated.sort_by_key(|o| o.id);
        report.resolved.sort_by_key(|o| o.id);
        report.failures.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(report)
    }

    fn fan_out(
        &self,
        desired: &[DesiredServiceSpec],
        observed: &BTreeMap<String, Vec<ObservedServiceState>>,
        radii: &BTreeMap<String, u32>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport> {
        let parallelism = self.config.parallelism.max(1).min(desired.len().max(1));
        let (work_tx, work_rx) = channel::bounded::<&DesiredServiceSpec>(desired.len().max(1));
        let (result_tx, result_rx) =
            channel::unbounded::<(String, Result<ServiceOutcome>)>();

        for spec in desired {
            let _ = work_tx.send(spec);
        }
        drop(work_tx);

        thread::scope(|scope| {
            for _ in 0..parallelism {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for spec in work_rx {
                        let rows = observed.get(&spec.service).map_or(&[][..], Vec::as_slice);
                        let radius = radii.get(&spec.service).copied().unwrap_or(1);
                        let outcome = self.reconcile_service(spec, rows, radius, now);
                        if result_tx.send((spec.service.clone(), outcome)).is_err() {
                            return;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut report = ReconcileReport {
            services_checked: desired.len(),
            ..ReconcileReport::default()
        };
        let mut fatal = None;
        for (service, outcome) in result_rx {
            match outcome {
                Ok(out) => {
                    report.opened.extend(out.opened);
                    report.updated.extend(out.updated);
                    report.resolved.extend(out.resolved);
                    report.unchanged += out.unchanged;
                }
                Err(err) if err.is_invariant_violation() => {
                    fatal.get_or_insert(err);
                }
                Err(err) => report.failures.push(ServiceFailure {
                    service,
                    code: err.code(),
                    details: err.to_string(),
                }),
            }
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    fn reconcile_service(
        &self,
        spec: &DesiredServiceSpec,
        observed: &[ObservedServiceState],
        blast_radius: u32,
        now: DateTime<Utc>,
    ) -> Result<ServiceOutcome> {
        let assessment = assess_service(spec, observed, blast_radius)?;
        let mut out = ServiceOutcome::default();
        for (category, verdict) in &assessment.verdicts {
            match verdict {
                Verdict::Drift(detection) => match self.store.upsert_drift(detection, now)? {
                    UpsertOutcome::Opened(row) => out.opened.push(row),
                    UpsertOutcome::Updated(row) => out.updated.push(row),
                    UpsertOutcome::Unchanged(_) => out.unchanged += 1,
                },
                Verdict::Clear => {
                    if let Some(row) = self.store.resolve_open_drift(
                        &assessment.service,
                        *category,
                        RESOLUTION_CLEARED,
                        now,
                    )? {
                        out.resolved.push(row);
                    }
                }
                Verdict::Unknown => {}
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::model::{DriftCategory, StateSnapshot};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 6, 0, 0).unwrap()
    }

    fn config() -> ReconcileConfig {
        ReconcileConfig {
            parallelism: 3,
            resolve_undeclared: true,
        }
    }

    fn declare(store: &Store, service: &str, domains: &[&str], loaded_at: DateTime<Utc>) {
        store
            .insert_desired_spec(&DesiredServiceSpec {
                app: "shop".to_string(),
                service: service.to_string(),
                environment: "prod".to_string(),
                image: format!("ghcr.io/acme/{service}"),
                tag: "1.5.0".to_string(),
                domains: domains.iter().map(|d| (*d).to_string()).collect(),
                labels: BTreeMap::new(),
                volumes: Vec::new(),
                networks: BTreeSet::from(["edge".to_string()]),
                source_file: format!("{service}/compose.yml"),
                loaded_at,
            })
            .unwrap();
    }

    fn observe(store: &Store, service: &str, tag: &str, replicas: &str, snapshot: &str, at: DateTime<Utc>) {
        store
            .insert_observed_state(&ObservedServiceState {
                service: service.to_string(),
                host: "node-1".to_string(),
                container_name: None,
                image: format!("ghcr.io/acme/{service}"),
                tag: tag.to_string(),
                replicas: replicas.to_string(),
                state: "running".to_string(),
                ports: Vec::new(),
                networks: BTreeSet::from(["edge".to_string()]),
                created_at: None,
                observed_at: at,
                snapshot_id: snapshot.to_string(),
            })
            .unwrap();
    }

    #[test]
    fn api_missing_from_latest_snapshot_is_route_orphaned() {
        let store = Store::open_in_memory().unwrap();
        declare(&store, "api", &["api.example.com"], t0());
        declare(&store, "web", &[], t0());
        observe(&store, "api", "1.5.0", "1/1", "s1", t0());
        observe(&store, "web", "1.5.0", "1/1", "s1", t0());
        observe(&store, "web", "1.5.0", "1/1", "s2", t0() + Duration::hours(6));

        let report = Reconciler::new(&store, config())
            .run(t0() + Duration::hours(6))
            .unwrap();
        assert!(report.is_clean());
        let categories: Vec<_> = report
            .opened
            .iter()
            .map(|o| (o.service_name.as_str(), o.category))
            .collect();
        assert!(categories.contains(&("api", DriftCategory::RouteOrphaned)));
        assert!(categories.contains(&("api", DriftCategory::ReplicaDeficit)));
        assert!(!categories.iter().any(|(s, _)| *s == "web"));
        let orphan = report
            .opened
            .iter()
            .find(|o| o.category == DriftCategory::RouteOrphaned)
            .unwrap();
        assert_eq!(orphan.blast_radius, 2);
    }

    #[test]
    fn repeated_pass_is_idempotent_then_resolves() {
        let store = Store::open_in_memory().unwrap();
        declare(&store, "api", &[], t0());
        observe(&store, "api", "1.4.2", "1/1", "s1", t0());

        let reconciler = Reconciler::new(&store, config());
        let first = reconciler.run(t0()).unwrap();
        assert_eq!(first.opened.len(), 1);
        let second = reconciler.run(t0() + Duration::hours(6)).unwrap();
        assert!(second.opened.is_empty());
        assert!(second.updated.is_empty());
        assert_eq!(second.unchanged, 1);

        observe(&store, "api", "1.5.0", "1/1", "s2", t0() + Duration::hours(7));
        let third = reconciler.run(t0() + Duration::hours(8)).unwrap();
        assert_eq!(third.resolved.len(), 1);
        assert_eq!(third.resolved[0].resolution.as_deref(), Some(RESOLUTION_CLEARED));
        assert!(store.open_drift().unwrap().is_empty());
    }

    #[test]
    fn malformed_service_does_not_abort_others() {
        let store = Store::open_in_memory().unwrap();
        declare(&store, "api", &[], t0());
        declare(&store, "worker", &[], t0());
        observe(&store, "api", "1.5.0", "sideways", "s1", t0());
        observe(&store, "worker", "1.5.0", "1/3", "s1", t0());

        let report = Reconciler::new(&store, config()).run(t0()).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].service, "api");
        assert_eq!(report.failures[0].code, "DLG-2002");
        assert_eq!(report.opened.len(), 1);
        assert_eq!(report.opened[0].service_name, "worker");
    }

    #[test]
    fn undeclared_service_drift_is_resolved() {
        let store = Store::open_in_memory().unwrap();
        declare(&store, "api", &[], t0());
        observe(&store, "api", "1.4.2", "1/1", "s1", t0());
        let reconciler = Reconciler::new(&store, config());
        assert_eq!(reconciler.run(t0()).unwrap().opened.len(), 1);

        // A later load of the same source that no longer declares api.
        declare(&store, "other", &[], t0());
        store
            .conn()
            .execute(
                "UPDATE desired_specs SET source_file = 'api/compose.yml', loaded_at = ?1
                 WHERE service = 'other'",
                [crate::core::time::format_ts(t0() + Duration::hours(1))],
            )
            .unwrap();
        let report = reconciler.run(t0() + Duration::hours(2)).unwrap();
        assert!(
            report
                .resolved
                .iter()
                .any(|r| r.service_name == "api"
                    && r.resolution.as_deref() == Some(RESOLUTION_UNDECLARED))
        );
    }

    #[test]
    fn empty_desired_set_is_a_no_op() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_snapshot(&StateSnapshot {
                snapshot_id: "s1".to_string(),
                host: "node-1".to_string(),
                disk_usage_pct: 10.0,
                memory_usage_pct: 10.0,
                service_count: 0,
                container_count: 0,
                captured_at: t0(),
                payload: serde_json::Value::Null,
            })
            .unwrap();
        let report = Reconciler::new(&store, config()).run(t0()).unwrap();
        assert_eq!(report.services_checked, 0);
        assert!(report.opened.is_empty());
    }
}
