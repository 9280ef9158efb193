//! Batch ingestion: per-record conversion, validation and append into the store.
//!
//! Every record is handled on its own. A record that fails to deserialize or
//! validate is excluded and reported; the rest of the batch still lands.
//! Store failures (retryable) abort the batch instead, and because a batch is
//! written in one transaction nothing from an aborted batch is kept.

#![allow(missing_docs)]

pub mod batch;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

pub use batch::{IngestBatch, IngestReport, RecordCounts, RejectedRecord, fingerprint};

use crate::core::errors::{DlgError, Result};
use crate::model::{
    DeployEvent, DesiredServiceSpec, DockerEvent, IncidentMarker, ObservedServiceState,
    StateSnapshot, VersionCheck,
};
use crate::store::{BatchWriter, IngestLogRow, Store};

/// Ingest a raw batch document, skipping content that was already ingested.
pub fn ingest_document(
    store: &Store,
    source: &str,
    bytes: &[u8],
    now: DateTime<Utc>,
) -> Result<IngestReport> {
    let fp = fingerprint(bytes);
    if store.fingerprint_seen(&fp)? {
        return Ok(duplicate_report(fp));
    }

    let batch = IngestBatch::from_slice(bytes)?;
    store.write_batch(|writer| {
        // Another writer may have landed the same content since the check above.
        if writer.fingerprint_seen(&fp)? {
            return Ok(duplicate_report(fp.clone()));
        }
        let mut report = load_batch(writer, &batch)?;
        writer.record_ingest(&IngestLogRow {
            fingerprint: fp.clone(),
            source: source.to_string(),
            ingested_at: now,
            accepted: report.accepted.total(),
            rejected: report.rejected.len(),
        })?;
        report.fingerprint = Some(fp.clone());
        Ok(report)
    })
}

fn duplicate_report(fp: String) -> IngestReport {
    IngestReport {
        fingerprint: Some(fp),
        duplicate: true,
        ..IngestReport::default()
    }
}

/// Append every valid record of `batch` to the store in one transaction.
pub fn ingest_batch(store: &Store, batch: &IngestBatch) -> Result<IngestReport> {
    store.write_batch(|writer| load_batch(writer, batch))
}

fn load_batch(writer: &BatchWriter<'_>, batch: &IngestBatch) -> Result<IngestReport> {
    let mut report = IngestReport {
        batch_id: batch.batch_id.clone(),
        ..IngestReport::default()
    };

    report.accepted.desired_specs = load_each(
        "desired_spec",
        &batch.desired_specs,
        &mut report.rejected,
        |spec: DesiredServiceSpec| {
            spec.validate()?;
            writer.insert_desired_spec(&spec).map(drop)
        },
    )?;
    report.accepted.observed_states = load_each(
        "observed_state",
        &batch.observed_states,
        &mut report.rejected,
        |state: ObservedServiceState| {
            state.validate()?;
            state.replica_count()?;
            writer.insert_observed_state(&state).map(drop)
        },
    )?;
    report.accepted.snapshots = load_each(
        "snapshot",
        &batch.snapshots,
        &mut report.rejected,
        |snapshot: StateSnapshot| {
            snapshot.validate()?;
            writer.insert_snapshot(&snapshot).map(drop)
        },
    )?;
    report.accepted.deploy_events = load_each(
        "deploy_event",
        &batch.deploy_events,
        &mut report.rejected,
        |event: DeployEvent| {
            event.validate()?;
            writer.append_deploy_event(&event).map(drop)
        },
    )?;
    report.accepted.docker_events = load_each(
        "docker_event",
        &batch.docker_events,
        &mut report.rejected,
        |event: DockerEvent| {
            event.validate()?;
            writer.append_docker_event(&event).map(drop)
        },
    )?;
    report.accepted.incidents = load_each(
        "incident",
        &batch.incidents,
        &mut report.rejected,
        |marker: IncidentMarker| {
            validate_incident(&marker)?;
            writer.insert_incident(&marker).map(drop)
        },
    )?;
    report.accepted.version_checks = load_each(
        "version_check",
        &batch.version_checks,
        &mut report.rejected,
        |check: VersionCheck| {
            if check.service.trim().is_empty() || check.deployed_version.trim().is_empty() {
                return Err(DlgError::InvalidQuery {
                    details: "version check requires service and deployed_version".to_string(),
                });
            }
            writer.insert_version_check(&check)
        },
    )?;

    Ok(report)
}

fn validate_incident(marker: &IncidentMarker) -> Result<()> {
    if marker.title.trim().is_empty() {
        return Err(DlgError::InvalidQuery {
            details: "incident requires a title".to_string(),
        });
    }
    if marker.affected_services.iter().all(|s| s.trim().is_empty()) {
        return Err(DlgError::InvalidQuery {
            details: "incident requires at least one affected service".to_string(),
        });
    }
    if let Some(resolved) = marker.resolved_at
        && resolved < marker.started_at
    {
        return Err(DlgError::InvalidTimeRange {
            start: crate::core::time::format_ts(marker.started_at),
            end: crate::core::time::format_ts(resolved),
        });
    }
    Ok(())
}

/// Convert and apply each record; collect rejections, propagate store failures.
fn load_each<T: DeserializeOwned>(
    kind: &'static str,
    records: &[serde_json::Value],
    rejected: &mut Vec<RejectedRecord>,
    mut apply: impl FnMut(T) -> Result<()>,
) -> Result<usize> {
    let mut accepted = 0;
    for (index, raw) in records.iter().enumerate() {
        let outcome = T::deserialize(raw)
            .map_err(|e| DlgError::MalformedRecord {
                kind,
                index,
                details: e.to_string(),
            })
            .and_then(&mut apply);
        match outcome {
            Ok(()) => accepted += 1,
            Err(err) if err.is_retryable() => return Err(err),
            Err(err) => rejected.push(RejectedRecord {
                kind,
                index,
                code: err.code(),
                details: err.to_string(),
            }),
        }
    }
    Ok(accepted)
}
