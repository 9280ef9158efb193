//! Finding past incidents that resemble a new one.

#![allow(missing_docs)]

use std::collections::BTreeSet;

use serde::Serialize;

use crate::core::config::PatternConfig;
use crate::core::errors::{DlgError, Result};
use crate::model::IncidentMarker;
use crate::store::Store;

/// Split a comma-separated service list. Entries are trimmed; empties dropped.
#[must_use]
pub fn parse_services(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternQuery {
    pub services: BTreeSet<String>,
    pub keywords: Option<String>,
    pub limit: Option<usize>,
}

impl PatternQuery {
    fn keyword(&self) -> Option<String> {
        self.keywords
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_lowercase)
    }
}

/// Matching incidents plus the truncation flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimilarIncidents {
    pub matches: Vec<IncidentMarker>,
    /// Effective cap after clamping the requested limit.
    pub limit: usize,
    /// More incidents matched than `limit` allowed.
    pub truncated: bool,
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(needle))
}

/// Incidents sharing a service with the query, or whose title or root cause
/// contains the keyword text. Newest first, ties by id descending.
pub fn match_incidents(
    incidents: &[IncidentMarker],
    query: &PatternQuery,
    config: &PatternConfig,
) -> Result<SimilarIncidents> {
    let keyword = query.keyword();
    if query.services.is_empty() && keyword.is_none() {
        return Err(DlgError::InvalidQuery {
            details: "provide at least one service or keyword".to_string(),
        });
    }
    let limit = query
        .limit
        .unwrap_or(config.default_limit)
        .clamp(1, config.max_limit.max(1));

    let mut hits: Vec<IncidentMarker> = incidents
        .iter()
        .filter(|m| {
            let by_service = query.services.iter().any(|s| m.affects(s));
            let by_keyword = keyword.as_deref().is_some_and(|k| {
                contains_ci(Some(&m.title), k) || contains_ci(m.root_cause.as_deref(), k)
            });
            by_service || by_keyword
        })
        .cloned()
        .collect();
    hits.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
    let truncated = hits.len() > limit;
    hits.truncate(limit);
    Ok(SimilarIncidents {
        matches: hits,
        limit,
        truncated,
    })
}

pub fn find_similar(
    store: &Store,
    query: &PatternQuery,
    config: &PatternConfig,
) -> Result<SimilarIncidents> {
    match_incidents(&store.all_incidents()?, query, config)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::model::IncidentSeverity;

    fn config() -> PatternConfig {
        PatternConfig {
            default_limit: 10,
            max_limit: 50,
        }
    }

    fn marker(id: i64, hours_ago: i64, title: &str, services: &[&str]) -> IncidentMarker {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        IncidentMarker {
            id,
            title: title.to_string(),
            severity: IncidentSeverity::Warning,
            started_at: now - Duration::hours(hours_ago),
            resolved_at: None,
            affected_services: services.iter().map(ToString::to_string).collect(),
            root_cause: None,
            resolution: None,
            knowledge_pack: None,
            timeline_query: None,
        }
    }

    #[test]
    fn services_split_and_trim() {
        let s = parse_services(" ghost, ,ghost-db ,");
        assert_eq!(s.into_iter().collect::<Vec<_>>(), vec!["ghost", "ghost-db"]);
    }

    #[test]
    fn empty_query_is_rejected() {
        let q = PatternQuery {
            keywords: Some("   ".to_string()),
            ..PatternQuery::default()
        };
        let err = match_incidents(&[], &q, &config()).unwrap_err();
        assert!(err.is_query_rejection());
    }

    #[test]
    fn service_or_keyword_matches_newest_first() {
        let mut with_cause = marker(3, 1, "latency spike", &["api"]);
        with_cause.root_cause = Some("OOM in worker".to_string());
        let incidents = vec![
            marker(1, 30, "ghost down", &["ghost"]),
            marker(2, 5, "disk full", &["minio"]),
            with_cause,
            marker(4, 5, "cert expired", &["proxy"]),
        ];
        let q = PatternQuery {
            services: parse_services("GHOST"),
            keywords: Some("oom".to_string()),
            limit: None,
        };
        let hits = match_incidents(&incidents, &q, &config()).unwrap();
        let ids: Vec<_> = hits.matches.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 1]);
        assert!(!hits.truncated);
    }

    #[test]
    fn limit_is_capped() {
        let incidents: Vec<_> = (0..80).map(|i| marker(i, i, "crash", &["a"])).collect();
        let q = PatternQuery {
            keywords: Some("crash".to_string()),
            limit: Some(500),
            ..PatternQuery::default()
        };
        let capped = match_incidents(&incidents, &q, &config()).unwrap();
        assert_eq!(capped.matches.len(), 50);
        assert_eq!(capped.limit, 50);
        assert!(capped.truncated);

        let q = PatternQuery {
            keywords: Some("crash".to_string()),
            ..PatternQuery::default()
        };
        let hits = match_incidents(&incidents, &q, &config()).unwrap();
        assert_eq!(hits.matches.len(), 10);
        assert_eq!(hits.matches[0].id, 0);
        assert!(hits.truncated);
    }

    #[test]
    fn exact_fit_is_not_truncated() {
        let incidents: Vec<_> = (0..10).map(|i| marker(i, i, "crash", &["a"])).collect();
        let q = PatternQuery {
            services: parse_services("a"),
            ..PatternQuery::default()
        };
        let hits = match_incidents(&incidents, &q, &config()).unwrap();
        assert_eq!(hits.matches.len(), 10);
        assert!(!hits.truncated);

        let mut more = incidents;
        more.push(marker(10, 10, "crash", &["a"]));
        assert!(match_incidents(&more, &q, &config()).unwrap().truncated);
    }
}
