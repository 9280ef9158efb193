//! Knowledge packs: a reusable signature, a learning name and a runbook
//! distilled from a resolved incident.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::core::errors::{DlgError, Result};
use crate::core::time::format_ts;
use crate::model::{IncidentMarker, IncidentSeverity};
use crate::store::Store;

const SYMPTOM_KEYWORDS: &[(&str, &str)] = &[
    ("oom", "Out of memory / OOM kill"),
    ("crash", "Service crash / restart loop"),
    ("timeout", "Request timeout"),
    ("502", "HTTP 502 Bad Gateway"),
    ("503", "HTTP 503 Service Unavailable"),
    ("521", "Cloudflare 521 (origin down)"),
    ("cert", "TLS certificate issue"),
    ("dns", "DNS resolution failure"),
    ("disk", "Disk space exhaustion"),
    ("memory", "Memory pressure"),
    ("cpu", "CPU saturation"),
    ("connection refused", "Connection refused"),
    ("deploy", "Deployment failure"),
    ("rollback", "Rollback required"),
];

const SLUG_MAX: usize = 40;

/// Lowercase, spaces to `_`, only alphanumerics and `_`, at most 40 chars.
#[must_use]
pub fn slugify(text: &str) -> String {
    text.to_lowercase()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .take(SLUG_MAX)
        .collect()
}

fn string_list(pack: Option<&Value>, key: &str) -> Vec<String> {
    pack.and_then(|p| p.get(key))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Keyword-derived symptoms followed by any listed in the existing pack,
/// deduplicated in first-seen order.
#[must_use]
pub fn extract_symptoms(marker: &IncidentMarker) -> Vec<String> {
    let text = format!(
        "{} {}",
        marker.title,
        marker.root_cause.as_deref().unwrap_or_default()
    )
    .to_lowercase();
    let derived = SYMPTOM_KEYWORDS
        .iter()
        .filter(|(kw, _)| text.contains(kw))
        .map(|(_, symptom)| (*symptom).to_string());
    let listed = string_list(marker.knowledge_pack.as_ref(), "symptoms");

    let mut seen = BTreeSet::new();
    derived
        .chain(listed)
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

/// Reusable fingerprint of a resolved incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncidentSignature {
    pub incident_id: i64,
    pub title: String,
    pub severity: IncidentSeverity,
    pub affected_services: BTreeSet<String>,
    pub symptoms: Vec<String>,
    pub root_cause: String,
    pub resolution: String,
    pub started_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub gotchas: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnowledgePack {
    pub learning_name: String,
    /// Present only when the incident has a saved timeline query.
    pub validated_query: Option<String>,
    pub signature: IncidentSignature,
    pub runbook: String,
    pub generated_at: DateTime<Utc>,
}

fn signature(marker: &IncidentMarker) -> Result<IncidentSignature> {
    let Some(resolved_at) = marker.resolved_at else {
        return Err(DlgError::IncidentState {
            id: marker.id,
            details: "is still open; resolve it before generating a knowledge pack".to_string(),
        });
    };
    let (Some(root_cause), Some(resolution)) = (&marker.root_cause, &marker.resolution) else {
        return Err(DlgError::IncidentState {
            id: marker.id,
            details: "needs both a root cause and a resolution".to_string(),
        });
    };
    Ok(IncidentSignature {
        incident_id: marker.id,
        title: marker.title.clone(),
        severity: marker.severity,
        affected_services: marker.affected_services.clone(),
        symptoms: extract_symptoms(marker),
        root_cause: root_cause.clone(),
        resolution: resolution.clone(),
        started_at: marker.started_at,
        resolved_at,
        duration_minutes: (resolved_at - marker.started_at).num_minutes().max(0),
        gotchas: string_list(marker.knowledge_pack.as_ref(), "gotchas"),
    })
}

fn bullet_list(out: &mut String, items: &[String], empty: &str) {
    if items.is_empty() {
        let _ = writeln!(out, "- {empty}");
    }
    for item in items {
        let _ = writeln!(out, "- {item}");
    }
}

/// Markdown runbook seeded from the signature.
#[must_use]
pub fn runbook(sig: &IncidentSignature, learning_name: &str) -> String {
    let services: Vec<&str> = sig.affected_services.iter().map(String::as_str).collect();
    let mut out = String::new();
    let _ = writeln!(out, "# Runbook: {}\n", sig.title);
    let _ = writeln!(out, "**Severity:** {}", sig.severity);
    let _ = writeln!(out, "**Affected Services:** {}", services.join(", "));
    let _ = writeln!(out, "**Duration:** {} minutes\n", sig.duration_minutes);
    let _ = writeln!(out, "## Symptoms\n");
    bullet_list(&mut out, &sig.symptoms, "none recorded");
    let _ = writeln!(out, "\n## Root Cause\n\n{}\n", sig.root_cause);
    let _ = writeln!(out, "## Resolution Steps\n\n{}\n", sig.resolution);
    let _ = writeln!(out, "## Gotchas\n");
    bullet_list(&mut out, &sig.gotchas, "none recorded");
    let _ = writeln!(out, "\n## Prevention\n");
    let _ = writeln!(out, "- Add a drift or health check covering: {}", services.join(", "));
    let _ = writeln!(out, "\n## Detection\n");
    let _ = writeln!(
        out,
        "- Search past incidents by service: `dlg incident similar --services {}`",
        services.join(",")
    );
    let _ = writeln!(out, "- Learning reference: `{learning_name}`");
    out
}

/// Build the pack for a resolved incident without persisting it.
pub fn build_knowledge_pack(marker: &IncidentMarker, now: DateTime<Utc>) -> Result<KnowledgePack> {
    let signature = signature(marker)?;
    let learning_name = format!("incident_sig_{}_{}", marker.id, slugify(&marker.title));
    let validated_query = marker
        .timeline_query
        .as_ref()
        .map(|_| format!("incident_{}_timeline", marker.id));
    let runbook = runbook(&signature, &learning_name);
    Ok(KnowledgePack {
        learning_name,
        validated_query,
        signature,
        runbook,
        generated_at: now,
    })
}

/// Merge generation markers into the incident's existing pack object.
#[must_use]
pub fn annotate_pack(existing: Option<&Value>, pack: &KnowledgePack) -> Value {
    let mut map = existing
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);
    map.insert("knowledge_pack_generated".to_string(), Value::Bool(true));
    map.insert("generated_at".to_string(), json!(format_ts(pack.generated_at)));
    map.insert(
        "artifacts".to_string(),
        json!({
            "validated_query": pack.validated_query,
            "learning": pack.learning_name,
        }),
    );
    Value::Object(map)
}

/// Generate the pack for incident `id` and record it on the marker.
pub fn generate_knowledge_pack(
    store: &Store,
    id: i64,
    now: DateTime<Utc>,
) -> Result<KnowledgePack> {
    let marker = store.incident(id)?.ok_or(DlgError::UnknownIncident { id })?;
    let pack = build_knowledge_pack(&marker, now)?;
    store.set_knowledge_pack(id, &annotate_pack(marker.knowledge_pack.as_ref(), &pack))?;
    Ok(pack)
}

/// Human-readable summary of an incident and its linked artifacts.
#[must_use]
pub fn render_incident_knowledge(marker: &IncidentMarker) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Incident #{}: {}", marker.id, marker.title);
    let _ = writeln!(out, "Severity: {}", marker.severity);
    let services: Vec<&str> = marker.affected_services.iter().map(String::as_str).collect();
    let _ = writeln!(out, "Services: {}", services.join(", "));
    let status = if marker.is_resolved() { "Resolved" } else { "ONGOING" };
    let _ = writeln!(out, "Status: {status}");
    if let Some(cause) = &marker.root_cause {
        let _ = writeln!(out, "Root cause: {cause}");
    }
    if let Some(resolution) = &marker.resolution {
        let _ = writeln!(out, "Resolution: {resolution}");
    }

    let pack = marker.knowledge_pack.as_ref();
    let gotchas = string_list(pack, "gotchas");
    if !gotchas.is_empty() {
        let _ = writeln!(out, "Gotchas:");
        for g in &gotchas {
            let _ = writeln!(out, "  - {g}");
        }
    }
    if let Some(artifacts) = pack.and_then(|p| p.get("artifacts")).and_then(Value::as_object) {
        let _ = writeln!(out, "Linked artifacts:");
        for (kind, name) in artifacts {
            if let Some(name) = name.as_str() {
                let _ = writeln!(out, "  - {kind}: {name}");
            }
        }
    }
    if let Some(at) = pack.and_then(|p| p.get("generated_at")).and_then(Value::as_str) {
        let _ = writeln!(out, "Knowledge pack generated: {at}");
    }
    out
}
