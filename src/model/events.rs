//! Append-only event facts and the unified timeline projection.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{DlgError, Result};

// ──────────────────── deploy events ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployEventType {
    Started,
    Succeeded,
    Failed,
}

impl DeployEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "started" => Some(Self::Started),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DeployEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deployment lifecycle fact. `id` is assigned by the store on append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployEvent {
    #[serde(default)]
    pub id: i64,
    pub event_type: DeployEventType,
    pub app: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub image_before: Option<String>,
    #[serde(default)]
    pub image_after: Option<String>,
    #[serde(default)]
    pub triggered_by: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl DeployEvent {
    pub fn validate(&self) -> Result<()> {
        if self.app.trim().is_empty() {
            return Err(DlgError::InvalidQuery {
                details: "deploy event requires app".to_string(),
            });
        }
        Ok(())
    }
}

// ──────────────────── docker events ────────────────────

/// A container lifecycle fact. Event types are an open set (`start`, `die`, `oom`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerEvent {
    #[serde(default)]
    pub id: i64,
    pub event_type: String,
    pub container_name: String,
    #[serde(default)]
    pub service: Option<String>,
    pub host: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl DockerEvent {
    /// Start/die pairs are what crash-loop detection counts. Case-insensitive.
    #[must_use]
    pub fn is_churn(&self) -> bool {
        let kind = self.event_type.as_str();
        kind.eq_ignore_ascii_case("start") || kind.eq_ignore_ascii_case("die")
    }

    #[must_use]
    pub fn is_oom(&self) -> bool {
        self.event_type.eq_ignore_ascii_case("oom")
    }

    /// The entity the timeline attributes this event to.
    #[must_use]
    pub fn entity(&self) -> &str {
        self.service.as_deref().unwrap_or(&self.container_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_type.trim().is_empty()
            || self.container_name.trim().is_empty()
            || self.host.trim().is_empty()
        {
            return Err(DlgError::InvalidQuery {
                details: "docker event requires event_type, container_name and host".to_string(),
            });
        }
        Ok(())
    }
}

// ──────────────────── incidents ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentSeverity {
    Info,
    Warning,
    Critical,
}

impl IncidentSeverity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for IncidentSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operator-recorded incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentMarker {
    #[serde(default)]
    pub id: i64,
    pub title: String,
    pub severity: IncidentSeverity,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    pub affected_services: BTreeSet<String>,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub knowledge_pack: Option<serde_json::Value>,
    #[serde(default)]
    pub timeline_query: Option<String>,
}

impl IncidentMarker {
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Case-insensitive membership in the affected-service set.
    #[must_use]
    pub fn affects(&self, service: &str) -> bool {
        self.affected_services
            .iter()
            .any(|s| s.eq_ignore_ascii_case(service))
    }
}

// ──────────────────── unified timeline ────────────────────

/// Origin of a timeline event. Declaration order is the tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Deploy,
    Docker,
    Incident,
}

impl EventSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Docker => "docker",
            Self::Incident => "incident",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "deploy" => Some(Self::Deploy),
            "docker" => Some(Self::Docker),
            "incident" => Some(Self::Incident),
            _ => None,
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only projection of a raw fact onto the shared timeline shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedTimelineEvent {
    pub occurred_at: DateTime<Utc>,
    pub source: EventSource,
    pub event_type: String,
    pub entity: String,
    pub environment: Option<String>,
    pub details: serde_json::Value,
    pub source_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn source_order_is_deploy_docker_incident() {
        let mut sources = vec![EventSource::Incident, EventSource::Deploy, EventSource::Docker];
        sources.sort();
        assert_eq!(
            sources,
            vec![EventSource::Deploy, EventSource::Docker, EventSource::Incident]
        );
    }

    #[test]
    fn docker_event_entity_prefers_service() {
        let mut event = DockerEvent {
            id: 1,
            event_type: "die".to_string(),
            container_name: "worker-7-abc".to_string(),
            service: Some("worker-7".to_string()),
            host: "node-2".to_string(),
            exit_code: Some(137),
            occurred_at: Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
            details: serde_json::Value::Null,
        };
        assert_eq!(event.entity(), "worker-7");
        assert!(event.is_churn());
        event.service = None;
        event.event_type = "oom".to_string();
        assert_eq!(event.entity(), "worker-7-abc");
        assert!(!event.is_churn());
        assert!(event.is_oom());
    }

    #[test]
    fn docker_event_kinds_ignore_case() {
        let mut event = DockerEvent {
            id: 1,
            event_type: "Die".to_string(),
            container_name: "worker-7-abc".to_string(),
            service: None,
            host: "node-2".to_string(),
            exit_code: None,
            occurred_at: Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
            details: serde_json::Value::Null,
        };
        assert!(event.is_churn());
        event.event_type = "START".to_string();
        assert!(event.is_churn());
        event.event_type = "OOM".to_string();
        assert!(event.is_oom());
        assert!(!event.is_churn());
        event.event_type = "exec_start".to_string();
        assert!(!event.is_churn());
    }

    #[test]
    fn incident_severity_rejects_unknown() {
        assert_eq!(IncidentSeverity::parse("Warning"), Some(IncidentSeverity::Warning));
        assert_eq!(IncidentSeverity::parse("sev1"), None);
    }

    #[test]
    fn deploy_event_deserializes_without_id() {
        let raw = serde_json::json!({
            "event_type": "succeeded",
            "app": "billing",
            "environment": "prod",
            "occurred_at": "2026-05-01T10:00:00Z"
        });
        let event: DeployEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.id, 0);
        assert_eq!(event.event_type, DeployEventType::Succeeded);
        assert!(event.details.is_null());
    }
}
