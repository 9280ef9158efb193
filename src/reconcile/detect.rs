//! Per-service drift detection: pure comparison of one desired spec against
//! the service's current observed rows.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};

use crate::core::errors::Result;
use crate::model::{DesiredServiceSpec, DriftCategory, DriftDetection, ObservedServiceState, Severity};

/// What one category's predicate says about a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The condition holds; upsert the open row.
    Drift(DriftDetection),
    /// The condition does not hold; resolve any open row.
    Clear,
    /// Not enough observed data to decide; leave any open row alone.
    Unknown,
}

/// Verdicts for every category of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAssessment {
    pub service: String,
    pub verdicts: BTreeMap<DriftCategory, Verdict>,
}

impl ServiceAssessment {
    pub fn detections(&self) -> impl Iterator<Item = &DriftDetection> {
        self.verdicts.values().filter_map(|v| match v {
            Verdict::Drift(d) => Some(d),
            _ => None,
        })
    }
}

/// Blast radius per declared service: one plus the number of other
/// services that share at least one network with it.
#[must_use]
pub fn blast_radii(desired: &[DesiredServiceSpec]) -> BTreeMap<String, u32> {
    desired
        .iter()
        .map(|spec| {
            let neighbours = desired
                .iter()
                .filter(|other| other.service != spec.service)
                .filter(|other| !other.networks.is_disjoint(&spec.networks))
                .count();
            let radius = u32::try_from(neighbours).unwrap_or(u32::MAX - 1) + 1;
            (spec.service.clone(), radius)
        })
        .collect()
}

/// Run every category predicate for one service.
///
/// `observed` holds the service's rows from each host's latest snapshot;
/// an empty slice means the service is absent.
pub fn assess_service(
    spec: &DesiredServiceSpec,
    observed: &[ObservedServiceState],
    blast_radius: u32,
) -> Result<ServiceAssessment> {
    spec.validate()?;
    let mut running = 0u32;
    let mut desired = 0u32;
    for row in observed {
        let count = row.replica_count()?;
        running = running.saturating_add(count.running);
        desired = desired.saturating_add(count.desired);
    }
    let ctx = Context {
        spec,
        observed,
        blast_radius: blast_radius.max(1),
        running,
        desired,
    };

    let verdicts = DriftCategory::ALL
        .into_iter()
        .map(|category| {
            let verdict = match category {
                DriftCategory::VersionMismatch => ctx.version_mismatch(),
                DriftCategory::RouteOrphaned => ctx.route_orphaned(),
                DriftCategory::ReplicaDeficit => ctx.replica_deficit(),
                DriftCategory::ConfigDrift => ctx.config_drift(),
            };
            (category, verdict)
        })
        .collect();

    Ok(ServiceAssessment {
        service: spec.service.clone(),
        verdicts,
    })
}

struct Context<'a> {
    spec: &'a DesiredServiceSpec,
    observed: &'a [ObservedServiceState],
    blast_radius: u32,
    running: u32,
    desired: u32,
}

impl Context<'_> {
    fn drift(
        &self,
        category: DriftCategory,
        severity: Severity,
        desired_value: String,
        actual_value: String,
        description: String,
    ) -> Verdict {
        Verdict::Drift(DriftDetection {
            service_name: self.spec.service.clone(),
            category,
            severity,
            desired_value,
            actual_value,
            description,
            blast_radius: self.blast_radius,
        })
    }

    fn version_mismatch(&self) -> Verdict {
        if self.observed.is_empty() {
            return Verdict::Unknown;
        }
        let want = self.spec.image_ref();
        let actual: BTreeSet<String> = self.observed.iter().map(ObservedServiceState::image_ref).collect();
        if actual.len() == 1 && actual.contains(&want) {
            return Verdict::Clear;
        }
        let actual = join(&actual);
        let description = format!("{} runs {actual}, declared {want}", self.spec.service);
        self.drift(
            DriftCategory::VersionMismatch,
            Severity::High,
            want,
            actual,
            description,
        )
    }

    fn route_orphaned(&self) -> Verdict {
        if self.spec.domains.is_empty() {
            return Verdict::Clear;
        }
        let actual = if self.observed.is_empty() {
            "absent".to_string()
        } else if !self.observed.iter().any(ObservedServiceState::is_running) {
            let states: BTreeSet<String> = self
                .observed
                .iter()
                .map(|o| o.state.to_ascii_lowercase())
                .collect();
            format!("not running ({})", join(&states))
        } else if self.running == 0 {
            "0 replicas".to_string()
        } else {
            return Verdict::Clear;
        };
        let domains = join(&self.spec.domains);
        let description = format!(
            "{domains} routed to {} which is {actual}",
            self.spec.service
        );
        self.drift(
            DriftCategory::RouteOrphaned,
            Severity::Critical,
            domains,
            actual,
            description,
        )
    }

    fn replica_deficit(&self) -> Verdict {
        if self.observed.is_empty() {
            let description = format!("{} has no observed containers", self.spec.service);
            return self.drift(
                DriftCategory::ReplicaDeficit,
                Severity::Medium,
                "running".to_string(),
                "absent".to_string(),
                description,
            );
        }
        if self.running >= self.desired {
            return Verdict::Clear;
        }
        let description = format!(
            "{} runs {} of {} replicas",
            self.spec.service, self.running, self.desired
        );
        self.drift(
            DriftCategory::ReplicaDeficit,
            Severity::Medium,
            self.desired.to_string(),
            self.running.to_string(),
            description,
        )
    }

    fn config_drift(&self) -> Verdict {
        if self.observed.is_empty() {
            return Verdict::Unknown;
        }
        if self.spec.networks.is_empty() {
            return Verdict::Clear;
        }
        let actual: BTreeSet<String> = self
            .observed
            .iter()
            .flat_map(|o| o.networks.iter().cloned())
            .collect();
        if actual == self.spec.networks {
            return Verdict::Clear;
        }
        let missing: Vec<&str> = self
            .spec
            .networks
            .difference(&actual)
            .map(String::as_str)
            .collect();
        let extra: Vec<&str> = actual
            .difference(&self.spec.networks)
            .map(String::as_str)
            .collect();
        let description = format!(
            "{} networks differ (missing: [{}], extra: [{}])",
            self.spec.service,
            missing.join(", "),
            extra.join(", ")
        );
        self.drift(
            DriftCategory::ConfigDrift,
            Severity::Medium,
            join(&self.spec.networks),
            join(&actual),
            description,
        )
    }
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}
