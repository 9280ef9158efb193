//! Debt scoring: severity- and age-weighted urgency for open drift, the
//! ranked ledger and the weekly trend.

#![allow(missing_docs)]

use std::cmp::Ordering;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::core::config::ScoringConfig;
use crate::model::{DriftObservation, Severity};

/// Multipliers per severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeverityWeights {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub default: u64,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self {
            critical: 10,
            high: 5,
            medium: 2,
            default: 1,
        }
    }
}

impl From<&ScoringConfig> for SeverityWeights {
    fn from(cfg: &ScoringConfig) -> Self {
        Self {
            critical: cfg.critical_weight,
            high: cfg.high_weight,
            medium: cfg.medium_weight,
            default: cfg.default_weight,
        }
    }
}

impl SeverityWeights {
    #[must_use]
    pub const fn weight(&self, severity: Severity) -> u64 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.default,
        }
    }
}

/// Whole days elapsed since `first_seen`, truncated; never negative.
#[must_use]
pub fn age_days(first_seen: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from((now - first_seen).num_days()).unwrap_or(0)
}

/// `weight(severity) * blast_radius * age_days`. Resolved observations score 0.
#[must_use]
pub fn debt_score(obs: &DriftObservation, weights: &SeverityWeights, now: DateTime<Utc>) -> u64 {
    if !obs.is_open() {
        return 0;
    }
    weights
        .weight(obs.severity)
        .saturating_mul(u64::from(obs.blast_radius.max(1)))
        .saturating_mul(age_days(obs.first_seen_at, now))
}

/// One ranked ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebtEntry {
    pub score: u64,
    pub age_days: u64,
    pub observation: DriftObservation,
}

/// Total order: score desc, then earliest first_seen, then lowest id.
fn ledger_order(a: &DebtEntry, b: &DebtEntry) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| a.observation.first_seen_at.cmp(&b.observation.first_seen_at))
        .then_with(|| a.observation.id.cmp(&b.observation.id))
}

/// Score and rank open observations. Resolved rows are dropped.
#[must_use]
pub fn rank(
    observations: impl IntoIterator<Item = DriftObservation>,
    weights: &SeverityWeights,
    now: DateTime<Utc>,
) -> Vec<DebtEntry> {
    let mut entries: Vec<DebtEntry> = observations
        .into_iter()
        .filter(DriftObservation::is_open)
        .map(|observation| DebtEntry {
            score: debt_score(&observation, weights, now),
            age_days: age_days(observation.first_seen_at, now),
            observation,
        })
        .collect();
    entries.sort_by(ledger_order);
    entries
}

/// Top-N ledger plus totals over every open row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebtLedger {
    pub generated_at: DateTime<Utc>,
    pub total_open: usize,
    pub total_score: u64,
    pub entries: Vec<DebtEntry>,
}

#[must_use]
pub fn build_ledger(
    observations: impl IntoIterator<Item = DriftObservation>,
    weights: &SeverityWeights,
    top_n: usize,
    now: DateTime<Utc>,
) -> DebtLedger {
    let mut entries = rank(observations, weights, now);
    let total_open = entries.len();
    let total_score = entries
        .iter()
        .fold(0u64, |acc, e| acc.saturating_add(e.score));
    entries.truncate(top_n);
    DebtLedger {
        generated_at: now,
        total_open,
        total_score,
        entries,
    }
}

// ──────────────────── weekly trend ────────────────────

/// Drift detected in one ISO week (Monday start), and what became of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeekTrend {
    pub week_start: NaiveDate,
    pub detected: usize,
    pub resolved: usize,
    pub unresolved: usize,
    /// Mean days from first seen to resolution over the resolved rows.
    pub avg_resolution_days: Option<f64>,
}

fn week_start(ts: DateTime<Utc>) -> NaiveDate {
    let date = ts.date_naive();
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// Weekly cohorts for the last `weeks` weeks (current week included), oldest first.
#[must_use]
pub fn weekly_trend(
    observations: &[DriftObservation],
    weeks: u32,
    now: DateTime<Utc>,
) -> Vec<WeekTrend> {
    let current = week_start(now);
    (0..i64::from(weeks))
        .rev()
        .map(|back| {
            let start = current - Duration::weeks(back);
            let cohort: Vec<&DriftObservation> = observations
                .iter()
                .filter(|o| week_start(o.first_seen_at) == start)
                .collect();
            let resolution_secs: Vec<i64> = cohort
                .iter()
                .filter_map(|o| o.resolved_at.map(|r| (r - o.first_seen_at).num_seconds()))
                .collect();
            let avg_resolution_days = if resolution_secs.is_empty() {
                None
            } else {
                let total: i64 = resolution_secs.iter().sum();
                #[allow(clippy::cast_precision_loss)]
                Some(total as f64 / resolution_secs.len() as f64 / 86_400.0)
            };
            WeekTrend {
                week_start: start,
                detected: cohort.len(),
                resolved: resolution_secs.len(),
                unresolved: cohort.len() - resolution_secs.len(),
                avg_resolution_days,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;
    use crate::model::DriftCategory;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 14, 12, 0, 0).unwrap()
    }

    fn obs(id: i64, severity: Severity, blast: u32, first_seen: DateTime<Utc>) -> DriftObservation {
        DriftObservation {
            id,
            service_name: format!("svc-{id}"),
            category: DriftCategory::ReplicaDeficit,
            severity,
            desired_value: "3".to_string(),
            actual_value: "1".to_string(),
            description: String::new(),
            blast_radius: blast,
            first_seen_at: first_seen,
            resolved_at: None,
            resolution: None,
        }
    }

    #[test]
    fn critical_blast_three_ten_days_scores_300() {
        let o = obs(1, Severity::Critical, 3, now() - Duration::days(10));
        assert_eq!(debt_score(&o, &SeverityWeights::default(), now()), 300);
    }

    #[test]
    fn age_truncates_and_clamps() {
        assert_eq!(age_days(now() - Duration::hours(47), now()), 1);
        assert_eq!(age_days(now() + Duration::days(2), now()), 0);
        let fresh = obs(1, Severity::Critical, 5, now() - Duration::hours(3));
        assert_eq!(debt_score(&fresh, &SeverityWeights::default(), now()), 0);
    }

    #[test]
    fn resolved_rows_score_zero_and_leave_the_ledger() {
        let mut o = obs(1, Severity::High, 2, now() - Duration::days(30));
        o.resolved_at = Some(now());
        assert_eq!(debt_score(&o, &SeverityWeights::default(), now()), 0);
        assert!(rank(vec![o], &SeverityWeights::default(), now()).is_empty());
    }

    #[test]
    fn ties_break_on_first_seen_then_id() {
        let day = now() - Duration::days(4);
        let entries = rank(
            vec![
                obs(3, Severity::Medium, 1, day),
                obs(2, Severity::Medium, 1, day),
                obs(1, Severity::Low, 2, day - Duration::hours(1)),
                obs(4, Severity::High, 1, day),
            ],
            &SeverityWeights::default(),
            now(),
        );
        let ids: Vec<i64> = entries.iter().map(|e| e.observation.id).collect();
        assert_eq!(ids, vec![4, 1, 2, 3]);
    }

    #[test]
    fn ledger_truncates_but_totals_everything() {
        let ledger = build_ledger(
            (1..=5).map(|i| obs(i, Severity::Medium, 1, now() - Duration::days(i))),
            &SeverityWeights::default(),
            2,
            now(),
        );
        assert_eq!(ledger.entries.len(), 2);
        assert_eq!(ledger.total_open, 5);
        assert_eq!(ledger.total_score, 2 * (1 + 2 + 3 + 4 + 5));
        assert_eq!(ledger.entries[0].observation.id, 5);
    }

    #[test]
    fn weekly_trend_buckets_by_first_seen_week() {
        // 2026-05-14 is a Thursday; its week starts Monday 2026-05-11.
        let mut resolved = obs(1, Severity::High, 1, now() - Duration::days(1));
        resolved.resolved_at = Some(resolved.first_seen_at + Duration::days(1));
        let open = obs(2, Severity::High, 1, now() - Duration::days(2));
        let last_week = obs(3, Severity::High, 1, now() - Duration::days(7));

        let trend = weekly_trend(&[resolved, open, last_week], 3, now());
        assert_eq!(trend.len(), 3);
        assert_eq!(trend[2].week_start, NaiveDate::from_ymd_opt(2026, 5, 11).unwrap());
        assert_eq!((trend[2].detected, trend[2].resolved, trend[2].unresolved), (2, 1, 1));
        assert_eq!(trend[2].avg_resolution_days, Some(1.0));
        assert_eq!(trend[1].detected, 1);
        assert_eq!(trend[0].detected, 0);
        assert_eq!(trend[0].avg_resolution_days, None);
    }

    fn arb_severity() -> impl Strategy<Value = Severity> {
        prop_oneof![
            Just(Severity::Low),
            Just(Severity::Medium),
            Just(Severity::High),
            Just(Severity::Critical),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Score never decreases as the observation ages.
        #[test]
        fn score_is_non_decreasing_in_age(
            severity in arb_severity(),
            blast in 1u32..50,
            age_hours in 0i64..10_000,
            extra_hours in 0i64..10_000,
        ) {
            let weights = SeverityWeights::default();
            let o = obs(1, severity, blast, now() - Duration::hours(age_hours));
            let earlier = debt_score(&o, &weights, now());
            let later = debt_score(&o, &weights, now() + Duration::hours(extra_hours));
            prop_assert!(later >= earlier);
        }

        /// At equal age and blast radius, higher severity never scores lower.
        #[test]
        fn score_follows_severity_weight(
            a in arb_severity(),
            b in arb_severity(),
            blast in 1u32..50,
            age_days in 0i64..400,
        ) {
            let weights = SeverityWeights::default();
            let seen = now() - Duration::days(age_days);
            let sa = debt_score(&obs(1, a, blast, seen), &weights, now());
            let sb = debt_score(&obs(2, b, blast, seen), &weights, now());
            if a >= b {
                prop_assert!(sa >= sb);
            }
        }
    }
}
