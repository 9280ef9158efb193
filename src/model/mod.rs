//! Engine data model: desired/observed state, raw event facts, drift
//! observations, incident markers, and the derived unified timeline event.

pub mod drift;
pub mod events;
pub mod state;

pub use drift::{
    DriftCategory, DriftDetection, DriftObservation, ResolveOutcome, Severity, UpsertOutcome,
};
pub use events::{
    DeployEvent, DeployEventType, DockerEvent, EventSource, IncidentMarker, IncidentSeverity,
    UnifiedTimelineEvent,
};
pub use state::{
    DesiredServiceSpec, ObservedServiceState, ReplicaCount, RiskTier, StateSnapshot, UpdateState,
    UpdateStatus, VersionCheck,
};
