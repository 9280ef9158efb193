//! Ingestion batch format, content fingerprinting and the per-batch report.

#![allow(missing_docs)]

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::errors::{DlgError, Result};

/// One collector hand-off. Records stay raw JSON until each is converted
/// and validated on its own, so one bad record cannot sink the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestBatch {
    pub batch_id: Option<String>,
    pub desired_specs: Vec<serde_json::Value>,
    pub observed_states: Vec<serde_json::Value>,
    pub snapshots: Vec<serde_json::Value>,
    pub deploy_events: Vec<serde_json::Value>,
    pub docker_events: Vec<serde_json::Value>,
    pub incidents: Vec<serde_json::Value>,
    pub version_checks: Vec<serde_json::Value>,
}

impl IngestBatch {
    /// Parse a batch document. Only the envelope must be well-formed here.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| DlgError::MalformedRecord {
            kind: "batch",
            index: 0,
            details: e.to_string(),
        })
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.desired_specs.len()
            + self.observed_states.len()
            + self.snapshots.len()
            + self.deploy_events.len()
            + self.docker_events.len()
            + self.incidents.len()
            + self.version_checks.len()
    }
}

/// Accepted-record counts per record kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub desired_specs: usize,
    pub observed_states: usize,
    pub snapshots: usize,
    pub deploy_events: usize,
    pub docker_events: usize,
    pub incidents: usize,
    pub version_checks: usize,
}

impl RecordCounts {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.desired_specs
            + self.observed_states
            + self.snapshots
            + self.deploy_events
            + self.docker_events
            + self.incidents
            + self.version_checks
    }
}

/// A record excluded from a batch, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub kind: &'static str,
    pub index: usize,
    pub code: &'static str,
    pub details: String,
}

/// Outcome of ingesting one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub batch_id: Option<String>,
    pub fingerprint: Option<String>,
    pub accepted: RecordCounts,
    pub rejected: Vec<RejectedRecord>,
    /// The same content was ingested before; nothing was written.
    pub duplicate: bool,
}

impl IngestReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Hex SHA-256 of a batch document.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}
