//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use drift_ledger::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{DlgError, Result};

// Model
pub use crate::model::{
    DeployEvent, DesiredServiceSpec, DockerEvent, DriftCategory, DriftObservation, IncidentMarker,
    IncidentSeverity, ObservedServiceState, Severity, StateSnapshot, UnifiedTimelineEvent,
    UpdateStatus, VersionCheck,
};

// Store
pub use crate::store::{DriftFilter, Store};

// Pipeline
pub use crate::ingest::{IngestBatch, IngestReport, ingest_document};
pub use crate::reconcile::{ReconcileReport, Reconciler};
pub use crate::scoring::{DebtLedger, SeverityWeights, build_ledger, weekly_trend};
pub use crate::timeline::{Timeline, TimelineQuery, load_timeline};
pub use crate::updates::track_updates;

// Incidents
pub use crate::incidents::{
    Correlation, KnowledgePack, NewIncident, PatternQuery, correlate_incident, create_incident,
    find_similar, generate_knowledge_pack, resolve_incident,
};

// Logging
pub use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle, spawn_logger};

// Daemon
#[cfg(feature = "daemon")]
pub use crate::daemon::{DriftDaemon, SignalHandler};
