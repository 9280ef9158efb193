//! Drift table: keyed upsert, resolution, listing and the uniqueness audit.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::Serialize;

use super::{Store, label_at, opt_ts_at, ts_at};
use crate::core::errors::{DlgError, Result};
use crate::core::time::format_ts;
use crate::model::{
    DriftCategory, DriftDetection, DriftObservation, ResolveOutcome, Severity, UpsertOutcome,
};

const DRIFT_COLUMNS: &str = "id, service_name, category, severity, desired_value, actual_value, \
     description, blast_radius, first_seen_at, resolved_at, resolution";

/// A key holding more than one unresolved row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateOpenKey {
    pub service_name: String,
    pub category: String,
    pub open_rows: usize,
}

/// Listing filter for drift history.
#[derive(Debug, Clone, Default)]
pub struct DriftFilter {
    pub service: Option<String>,
    pub category: Option<DriftCategory>,
    pub include_resolved: bool,
    pub limit: Option<usize>,
}

impl Store {
    /// Insert-or-update the unresolved row for `(service, category)`.
    ///
    /// Unchanged detections leave the row untouched; changed detections
    /// update it in place and keep `first_seen_at`.
    pub fn upsert_drift(
        &self,
        detection: &DriftDetection,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let open = open_rows_for_key(&tx, &detection.service_name, detection.category)?;

        let outcome = match open.as_slice() {
            [] => {
                tx.prepare_cached(
                    "INSERT INTO drift_observations (
                    service_name, category, severity, desired_value, actual_value,
                    description, blast_radius, first_seen_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                )?
                .execute(params![
                    detection.service_name,
                    detection.category.as_str(),
                    detection.severity.as_str(),
                    detection.desired_value,
                    detection.actual_value,
                    detection.description,
                    detection.blast_radius.max(1),
                    format_ts(now),
                ])?;
                let id = tx.last_insert_rowid();
                UpsertOutcome::Opened(require_row(&tx, id)?)
            }
            [row] if detection.matches(row) => UpsertOutcome::Unchanged(row.clone()),
            [row] => {
                tx.prepare_cached(
                    "UPDATE drift_observations
                     SET severity = ?2, desired_value = ?3, actual_value = ?4,
                         description = ?5, blast_radius = ?6
                     WHERE id = ?1 AND resolved_at IS NULL",
                )?
                .execute(params![
                    row.id,
                    detection.severity.as_str(),
                    detection.desired_value,
                    detection.actual_value,
                    detection.description,
                    detection.blast_radius.max(1),
                ])?;
                UpsertOutcome::Updated(require_row(&tx, row.id)?)
            }
            rows => {
                return Err(DlgError::DuplicateOpenDrift {
                    service: detection.service_name.clone(),
                    category: detection.category.as_str().to_string(),
                    open_rows: rows.len(),
                });
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Resolve the unresolved row under a key, if any.
    pub fn resolve_open_drift(
        &self,
        service_name: &str,
        category: DriftCategory,
        resolution: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DriftObservation>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let open = open_rows_for_key(&tx, service_name, category)?;
        let resolved = match open.as_slice() {
            [] => None,
            [row] => {
                mark_resolved(&tx, row.id, resolution, now)?;
                Some(require_row(&tx, row.id)?)
            }
            rows => {
                return Err(DlgError::DuplicateOpenDrift {
                    service: service_name.to_string(),
                    category: category.as_str().to_string(),
                    open_rows: rows.len(),
                });
            }
        };
        tx.commit()?;
        Ok(resolved)
    }

    /// Resolve a specific row by id. Resolving a resolved row changes nothing.
    pub fn resolve_drift(
        &self,
        id: i64,
        resolution: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolveOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(row) = fetch_row(&tx, id)? else {
            return Err(DlgError::UnknownDrift { id });
        };
        if !row.is_open() {
            return Ok(ResolveOutcome::AlreadyResolved(row));
        }
        mark_resolved(&tx, id, resolution, now)?;
        let row = require_row(&tx, id)?;
        tx.commit()?;
        Ok(ResolveOutcome::Resolved(row))
    }

    /// Fetch one drift row.
    pub fn drift(&self, id: i64) -> Result<Option<DriftObservation>> {
        fetch_row(&self.conn(), id)
    }

    /// All unresolved rows, oldest first.
    pub fn open_drift(&self) -> Result<Vec<DriftObservation>> {
        self.list_drift(&DriftFilter::default())
    }

    /// Drift rows matching `filter`, oldest first.
    pub fn list_drift(&self, filter: &DriftFilter) -> Result<Vec<DriftObservation>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {DRIFT_COLUMNS} FROM drift_observations
             WHERE (?1 OR resolved_at IS NULL)
               AND (?2 IS NULL OR lower(service_name) = lower(?2))
               AND (?3 IS NULL OR category = ?3)
             ORDER BY first_seen_at ASC, id ASC
             LIMIT ?4"
        );
        let limit = filter
            .limit
            .map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    filter.include_resolved,
                    filter.service,
                    filter.category.map(DriftCategory::as_str),
                    limit,
                ],
                drift_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Keys that currently hold more than one unresolved row.
    pub fn audit_open_drift(&self) -> Result<Vec<DuplicateOpenKey>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT service_name, category, COUNT(*) FROM drift_observations
             WHERE resolved_at IS NULL
             GROUP BY service_name, category
             HAVING COUNT(*) > 1
             ORDER BY service_name, category",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DuplicateOpenKey {
                    service_name: row.get(0)?,
                    category: row.get(1)?,
                    open_rows: usize::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn drift_from_row(row: &Row<'_>) -> rusqlite::Result<DriftObservation> {
    Ok(DriftObservation {
        id: row.get(0)?,
        service_name: row.get(1)?,
        category: label_at(row, 2, "drift category", DriftCategory::parse)?,
        severity: Severity::from_label(&row.get::<_, String>(3)?),
        desired_value: row.get(4)?,
        actual_value: row.get(5)?,
        description: row.get(6)?,
        blast_radius: row.get(7)?,
        first_seen_at: ts_at(row, 8)?,
        resolved_at: opt_ts_at(row, 9)?,
        resolution: row.get(10)?,
    })
}

fn open_rows_for_key(
    conn: &Connection,
    service_name: &str,
    category: DriftCategory,
) -> Result<Vec<DriftObservation>> {
    let sql = format!(
        "SELECT {DRIFT_COLUMNS} FROM drift_observations
         WHERE service_name = ?1 AND category = ?2 AND resolved_at IS NULL
         ORDER BY id ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params![service_name, category.as_str()], drift_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn fetch_row(conn: &Connection, id: i64) -> Result<Option<DriftObservation>> {
    let sql = format!("SELECT {DRIFT_COLUMNS} FROM drift_observations WHERE id = ?1");
    Ok(conn
        .prepare_cached(&sql)?
        .query_row(params![id], drift_from_row)
        .optional()?)
}

fn require_row(conn: &Connection, id: i64) -> Result<DriftObservation> {
    fetch_row(conn, id)?.ok_or(DlgError::UnknownDrift { id })
}

fn mark_resolved(
    conn: &Connection,
    id: i64,
    resolution: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.prepare_cached(
        "UPDATE drift_observations SET resolved_at = ?2, resolution = ?3
         WHERE id = ?1 AND resolved_at IS NULL",
    )?
    .execute(params![id, format_ts(now), resolution])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()
    }

    fn detection(service: &str, category: DriftCategory, actual: &str) -> DriftDetection {
        DriftDetection {
            service_name: service.to_string(),
            category,
            severity: Severity::High,
            desired_value: "ghcr.io/acme/api:1.5.0".to_string(),
            actual_value: actual.to_string(),
            description: format!("{service} runs {actual}"),
            blast_radius: 2,
        }
    }

    #[test]
    fn first_detection_opens_row() {
        let store = Store::open_in_memory().unwrap();
        let outcome = store
            .upsert_drift(&detection("api", DriftCategory::VersionMismatch, "1.4.2"), t0())
            .unwrap();
        let UpsertOutcome::Opened(row) = outcome else {
            panic!("expected Opened");
        };
        assert!(row.is_open());
        assert_eq!(row.first_seen_at, t0());
        assert_eq!(row.blast_radius, 2);
    }

    #[test]
    fn repeated_detection_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let d = detection("api", DriftCategory::VersionMismatch, "1.4.2");
        store.upsert_drift(&d, t0()).unwrap();
        let second = store.upsert_drift(&d, t0() + Duration::hours(6)).unwrap();
        assert!(matches!(second, UpsertOutcome::Unchanged(_)));
        assert_eq!(store.open_drift().unwrap().len(), 1);
    }

    #[test]
    fn changed_detection_updates_in_place() {
        let store = Store::open_in_memory().unwrap();
        let opened = store
            .upsert_drift(&detection("api", DriftCategory::VersionMismatch, "1.4.2"), t0())
            .unwrap();
        let updated = store
            .upsert_drift(
                &detection("api", DriftCategory::VersionMismatch, "1.4.3"),
                t0() + Duration::days(1),
            )
            .unwrap();
        let UpsertOutcome::Updated(row) = updated else {
            panic!("expected Updated");
        };
        assert_eq!(row.id, opened.observation().id);
        assert_eq!(row.actual_value, "1.4.3");
        assert_eq!(row.first_seen_at, t0());
    }

    #[test]
    fn resolve_is_once_and_redetection_opens_new_row() {
        let store = Store::open_in_memory().unwrap();
        let d = detection("api", DriftCategory::ReplicaDeficit, "1/3");
        let first = store.upsert_drift(&d, t0()).unwrap().observation().clone();

        let resolved_at = t0() + Duration::hours(2);
        let resolved = store
            .resolve_open_drift("api", DriftCategory::ReplicaDeficit, "condition cleared", resolved_at)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.resolved_at, Some(resolved_at));
        assert_eq!(resolved.resolution.as_deref(), Some("condition cleared"));

        let again = store
            .resolve_drift(first.id, "manual", resolved_at + Duration::hours(1))
            .unwrap();
        let ResolveOutcome::AlreadyResolved(row) = again else {
            panic!("expected AlreadyResolved");
        };
        assert_eq!(row.resolved_at, Some(resolved_at));
        assert_eq!(row.resolution.as_deref(), Some("condition cleared"));

        let reopened = store
            .upsert_drift(&d, t0() + Duration::days(1))
            .unwrap();
        assert!(matches!(reopened, UpsertOutcome::Opened(_)));
        assert_ne!(reopened.observation().id, first.id);
    }

    #[test]
    fn resolving_unknown_row_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let err = store.resolve_drift(42, "manual", t0()).unwrap_err();
        assert_eq!(err.code(), "DLG-2303");
        assert!(
            store
                .resolve_open_drift("api", DriftCategory::ConfigDrift, "x", t0())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn partial_index_rejects_second_open_row() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_drift(&detection("api", DriftCategory::ConfigDrift, "edge"), t0())
            .unwrap();
        let conn = store.conn();
        let raw = conn.execute(
            "INSERT INTO drift_observations (
                service_name, category, severity, desired_value, actual_value,
                description, blast_radius, first_seen_at
            ) VALUES ('api','config-drift','medium','a','b','dup',1,'2026-05-01T00:00:00.000Z')",
            [],
        );
        assert!(raw.is_err());
    }

    #[test]
    fn audit_reports_legacy_duplicates() {
        let store = Store::open_in_memory().unwrap();
        {
            let conn = store.conn();
            conn.execute_batch(
                "DROP INDEX idx_drift_open_key;
                 INSERT INTO drift_observations (service_name, category, severity,
                    desired_value, actual_value, description, blast_radius, first_seen_at)
                 VALUES ('api','config-drift','medium','a','b','one',1,'2026-05-01T00:00:00.000Z'),
                        ('api','config-drift','medium','a','c','two',1,'2026-05-02T00:00:00.000Z');",
            )
            .unwrap();
        }
        let dups = store.audit_open_drift().unwrap();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].open_rows, 2);

        let err = store
            .upsert_drift(&detection("api", DriftCategory::ConfigDrift, "d"), t0())
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn list_filters_by_service_and_resolution() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_drift(&detection("api", DriftCategory::ConfigDrift, "edge"), t0())
            .unwrap();
        store
            .upsert_drift(&detection("web", DriftCategory::ConfigDrift, "edge"), t0())
            .unwrap();
        store
            .resolve_open_drift("web", DriftCategory::ConfigDrift, "condition cleared", t0())
            .unwrap();

        assert_eq!(store.open_drift().unwrap().len(), 1);
        let all = store
            .list_drift(&DriftFilter {
                include_resolved: true,
                ..DriftFilter::default()
            })
            .unwrap();
        assert_eq!(all.len(), 2);
        let web = store
            .list_drift(&DriftFilter {
                service: Some("WEB".to_string()),
                include_resolved: true,
                ..DriftFilter::default()
            })
            .unwrap();
        assert_eq!(web.len(), 1);
        assert!(!web[0].is_open());
    }

    // ──────────────────── property tests ────────────────────

    #[derive(Debug, Clone)]
    enum Op {
        Detect { key: usize, value: u8 },
        ResolveKey { key: usize },
        ResolveNth { nth: usize },
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..4, 0u8..3).prop_map(|(key, value)| Op::Detect { key, value }),
            (0usize..4).prop_map(|key| Op::ResolveKey { key }),
            (0usize..16).prop_map(|nth| Op::ResolveNth { nth }),
        ]
    }

    fn key(idx: usize) -> (&'static str, DriftCategory) {
        let service = if idx % 2 == 0 { "api" } else { "worker" };
        let category = if idx < 2 {
            DriftCategory::VersionMismatch
        } else {
            DriftCategory::ReplicaDeficit
        };
        (service, category)
    }

    #[test]
    fn racing_handles_never_open_duplicate_rows() {
        const WORKERS: usize = 8;
        const ROUNDS: usize = 50;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift.sqlite3");
        let handles: Vec<Store> = (0..WORKERS).map(|_| Store::open(&path).unwrap()).collect();

        let failures: Vec<String> = std::thread::scope(|scope| {
            let workers: Vec<_> = handles
                .iter()
                .enumerate()
                .map(|(worker, store)| {
                    scope.spawn(move || {
                        let mut errors = Vec::new();
                        for round in 0..ROUNDS {
                            let now = t0() + Duration::seconds(i64::try_from(round).unwrap());
                            let result = if round % 3 == 2 {
                                store
                                    .resolve_open_drift(
                                        "api",
                                        DriftCategory::VersionMismatch,
                                        "condition cleared",
                                        now,
                                    )
                                    .map(drop)
                            } else {
                                let actual = format!("1.4.{}", (worker + round) % 4);
                                store
                                    .upsert_drift(
                                        &detection("api", DriftCategory::VersionMismatch, &actual),
                                        now,
                                    )
                                    .map(drop)
                            };
                            if let Err(e) = result {
                                errors.push(e.to_string());
                            }
                        }
                        errors
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });

        assert!(failures.is_empty(), "store errors: {failures:?}");
        let store = Store::open(&path).unwrap();
        assert!(store.audit_open_drift().unwrap().is_empty());
        let rows = store
            .list_drift(&DriftFilter {
                include_resolved: true,
                ..DriftFilter::default()
            })
            .unwrap();
        assert!(!rows.is_empty());
        assert!(rows.iter().filter(|r| r.is_open()).count() <= 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Any detect/resolve sequence keeps at most one open row per key,
        /// and a resolved row's resolved_at never changes.
        #[test]
        fn open_rows_stay_unique(ops in prop::collection::vec(arb_op(), 1..40)) {
            let store = Store::open_in_memory().unwrap();
            let mut frozen: HashMap<i64, DateTime<Utc>> = HashMap::new();

            for (step, op) in ops.into_iter().enumerate() {
                let now = t0() + Duration::minutes(i64::try_from(step).unwrap());
                match op {
                    Op::Detect { key: k, value } => {
                        let (service, category) = key(k);
                        store
                            .upsert_drift(&detection(service, category, &format!("v{value}")), now)
                            .unwrap();
                    }
                    Op::ResolveKey { key: k } => {
                        let (service, category) = key(k);
                        store
                            .resolve_open_drift(service, category, "condition cleared", now)
                            .unwrap();
                    }
                    Op::ResolveNth { nth } => {
                        let all = store
                            .list_drift(&DriftFilter { include_resolved: true, ..DriftFilter::default() })
                            .unwrap();
                        if let Some(row) = all.get(nth) {
                            store.resolve_drift(row.id, "manual", now).unwrap();
                        }
                    }
                }

                prop_assert!(store.audit_open_drift().unwrap().is_empty());
                let all = store
                    .list_drift(&DriftFilter { include_resolved: true, ..DriftFilter::default() })
                    .unwrap();
                for row in &all {
                    if let Some(at) = row.resolved_at {
                        let first = *frozen.entry(row.id).or_insert(at);
                        prop_assert_eq!(first, at);
                    }
                }
            }
        }
    }
}
