//! Library-level end-to-end scenarios: ingest -> reconcile -> score,
//! incident lifecycle and correlation, update risk and fleet reports.

mod common;

use chrono::{DateTime, Duration, Utc};
use drift_ledger::core::config::{
    CorrelationConfig, CrashLoopConfig, PatternConfig, ReconcileConfig, ScoringConfig,
    UpdatesConfig,
};
use drift_ledger::incidents::{
    NewIncident, PatternQuery, correlate_incident, create_incident, find_similar,
    generate_knowledge_pack, parse_services, resolve_incident,
};
use drift_ledger::ingest::{IngestReport, ingest_document};
use drift_ledger::model::{DriftCategory, EventSource, RiskTier, UpdateState};
use drift_ledger::reconcile::{ReconcileReport, Reconciler};
use drift_ledger::reports::{
    load_crash_loops, load_orphaned_routes, load_platform_health, load_update_backlog,
};
use drift_ledger::scoring::{SeverityWeights, build_ledger};
use drift_ledger::store::Store;
use drift_ledger::timeline::{TimelineQuery, load_timeline};
use drift_ledger::updates::track_updates;

fn ts(raw: &str) -> DateTime<Utc> {
    raw.parse().expect("valid timestamp")
}

fn ingest(store: &Store, doc: &serde_json::Value, at: DateTime<Utc>) -> IngestReport {
    let report = ingest_document(store, "fixture", doc.to_string().as_bytes(), at).unwrap();
    assert!(report.rejected.is_empty(), "rejected: {:?}", report.rejected);
    report
}

fn reconcile(store: &Store, at: DateTime<Utc>) -> ReconcileReport {
    Reconciler::new(
        store,
        ReconcileConfig {
            parallelism: 2,
            resolve_undeclared: true,
        },
    )
    .run(at)
    .unwrap()
}

#[test]
fn orphaned_route_scores_three_hundred_after_ten_days() {
    let store = Store::open_in_memory().unwrap();
    let at = ts("2026-05-01T06:00:00Z");
    ingest(&store, &common::fleet_batch("b1", "2026-05-01T06:00:00Z", false), at);

    let report = reconcile(&store, at);
    assert_eq!(report.services_checked, 3);
    assert!(report.is_clean());
    let opened: Vec<(&str, DriftCategory)> = report
        .opened
        .iter()
        .map(|o| (o.service_name.as_str(), o.category))
        .collect();
    assert!(opened.contains(&("api", DriftCategory::RouteOrphaned)));
    assert!(opened.contains(&("api", DriftCategory::ReplicaDeficit)));
    assert!(opened.iter().all(|(service, _)| *service == "api"));

    let weights = SeverityWeights::from(&ScoringConfig::default());
    let ledger = build_ledger(store.open_drift().unwrap(), &weights, 20, at + Duration::days(10));
    assert_eq!(ledger.total_open, 2);
    assert_eq!(ledger.entries[0].observation.category, DriftCategory::RouteOrphaned);
    assert_eq!(ledger.entries[0].observation.blast_radius, 3);
    assert_eq!(ledger.entries[0].score, 300);
    assert_eq!(ledger.entries[1].score, 60);

    let routes = load_orphaned_routes(&store).unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].domain, "api.example.com");
    assert_eq!(routes[0].actual, "absent");
}

#[test]
fn drift_resolves_then_redetection_opens_a_new_row() {
    let store = Store::open_in_memory().unwrap();
    let t0 = ts("2026-05-01T06:00:00Z");
    let t1 = ts("2026-05-01T12:00:00Z");
    let t2 = ts("2026-05-01T18:00:00Z");

    ingest(&store, &common::fleet_batch("b1", "2026-05-01T06:00:00Z", false), t0);
    let first = reconcile(&store, t0);
    let route_id = first
        .opened
        .iter()
        .find(|o| o.category == DriftCategory::RouteOrphaned)
        .map(|o| o.id)
        .unwrap();

    // Same facts again: nothing new.
    let again = reconcile(&store, t0 + Duration::minutes(5));
    assert!(again.opened.is_empty());
    assert_eq!(again.unchanged, 2);

    ingest(&store, &common::fleet_batch("b2", "2026-05-01T12:00:00Z", true), t1);
    let healed = reconcile(&store, t1);
    assert_eq!(healed.resolved.len(), 2);
    assert!(store.open_drift().unwrap().is_empty());
    let resolved = store.drift(route_id).unwrap().unwrap();
    assert_eq!(resolved.resolved_at, Some(t1));

    ingest(&store, &common::fleet_batch("b3", "2026-05-01T18:00:00Z", false), t2);
    let relapse = reconcile(&store, t2);
    let new_route = relapse
        .opened
        .iter()
        .find(|o| o.category == DriftCategory::RouteOrphaned)
        .unwrap();
    assert_ne!(new_route.id, route_id);
    assert_eq!(new_route.first_seen_at, t2);
    assert_eq!(store.drift(route_id).unwrap().unwrap().resolved_at, Some(t1));
    assert!(store.audit_open_drift().unwrap().is_empty());
}

#[test]
fn duplicate_batch_content_is_skipped() {
    let store = Store::open_in_memory().unwrap();
    let at = ts("2026-05-01T06:00:00Z");
    let doc = common::fleet_batch("b1", "2026-05-01T06:00:00Z", true).to_string();
    let first = ingest_document(&store, "a", doc.as_bytes(), at).unwrap();
    let second = ingest_document(&store, "b", doc.as_bytes(), at).unwrap();
    assert!(!first.duplicate);
    assert_eq!(first.accepted.desired_specs, 3);
    assert!(second.duplicate);
    assert_eq!(second.accepted.total(), 0);
    assert_eq!(second.fingerprint, first.fingerprint);
}

#[test]
fn incident_lifecycle_correlation_and_knowledge() {
    let store = Store::open_in_memory().unwrap();
    let started = ts("2026-05-01T06:00:00Z");
    let resolved = ts("2026-05-01T06:30:00Z");
    ingest(&store, &common::events_batch(), started);

    let new = NewIncident::from_raw("api 502 storm", "critical", "api, ,edge", started).unwrap();
    assert_eq!(new.affected_services, parse_services("api,edge"));
    let marker = create_incident(&store, &new, 15).unwrap();
    assert_eq!(
        marker.timeline_query.as_deref(),
        Some(format!("correlate {} --margin-minutes 15", marker.id).as_str())
    );

    let config = CorrelationConfig::default();
    let ongoing = correlate_incident(&store, marker.id, &config, resolved).unwrap();
    assert_eq!(ongoing.timeline.start, started - Duration::minutes(15));
    assert_eq!(ongoing.timeline.end, resolved + Duration::minutes(15));

    let marker = resolve_incident(
        &store,
        marker.id,
        "connection pool exhausted after deploy",
        "rolled back and raised pool size",
        None,
        resolved,
    )
    .unwrap();
    assert!(marker.is_resolved());
    let again = resolve_incident(&store, marker.id, "x", "y", None, resolved);
    assert_eq!(again.unwrap_err().code(), "DLG-2305");

    // Window is fixed once resolved, no matter when it is asked.
    let later = correlate_incident(&store, marker.id, &config, resolved + Duration::days(3)).unwrap();
    assert_eq!(later.timeline.start, ts("2026-05-01T05:45:00Z"));
    assert_eq!(later.timeline.end, ts("2026-05-01T06:45:00Z"));
    let times: Vec<DateTime<Utc>> = later.timeline.events.iter().map(|e| e.occurred_at).collect();
    assert_eq!(
        times,
        vec![
            ts("2026-05-01T05:50:00Z"),
            ts("2026-05-01T05:58:00Z"),
            ts("2026-05-01T06:00:00Z"),
            ts("2026-05-01T06:10:00Z"),
            ts("2026-05-01T06:30:00Z"),
            ts("2026-05-01T06:40:00Z"),
        ]
    );
    assert!(
        later
            .timeline
            .events
            .iter()
            .any(|e| e.source == EventSource::Incident)
    );
    assert!(!later.timeline.truncated);

    let pack = generate_knowledge_pack(&store, marker.id, resolved).unwrap();
    assert!(pack.learning_name.starts_with(&format!("incident_sig_{}_", marker.id)));
    assert_eq!(
        pack.validated_query,
        Some(format!("incident_{}_timeline", marker.id))
    );
    assert_eq!(pack.signature.duration_minutes, 30);
    assert!(pack.runbook.contains("# Runbook:"));
    let stored = store.incident(marker.id).unwrap().unwrap();
    let kp = stored.knowledge_pack.unwrap();
    assert_eq!(kp["knowledge_pack_generated"], serde_json::json!(true));

    let similar = find_similar(
        &store,
        &PatternQuery {
            keywords: Some("POOL".to_string()),
            ..PatternQuery::default()
        },
        &PatternConfig::default(),
    )
    .unwrap();
    assert_eq!(similar.matches.len(), 1);
    assert_eq!(similar.matches[0].id, marker.id);
    assert!(!similar.truncated);
}

#[test]
fn timeline_sub_window_matches_filtered_full_window() {
    let store = Store::open_in_memory().unwrap();
    ingest(&store, &common::events_batch(), ts("2026-05-01T07:00:00Z"));

    let full_query = TimelineQuery::window(ts("2026-04-30T00:00:00Z"), ts("2026-05-02T00:00:00Z"))
        .with_limit(500, 500);
    let full = load_timeline(&store, &full_query).unwrap();
    assert_eq!(full, load_timeline(&store, &full_query).unwrap());
    assert_eq!(full.events.len(), 7);

    let (start, end) = (ts("2026-05-01T05:45:00Z"), ts("2026-05-01T06:45:00Z"));
    let sub = load_timeline(
        &store,
        &TimelineQuery::window(start, end).with_limit(500, 500),
    )
    .unwrap();
    let filtered: Vec<_> = full
        .events
        .iter()
        .filter(|e| e.occurred_at >= start && e.occurred_at <= end)
        .cloned()
        .collect();
    assert_eq!(sub.events, filtered);

    let reversed = load_timeline(&store, &TimelineQuery::window(end, start));
    assert_eq!(reversed.unwrap_err().code(), "DLG-2301");
}

#[test]
fn recent_incident_elevates_update_risk_and_feeds_health() {
    let store = Store::open_in_memory().unwrap();
    let at = ts("2026-05-01T07:00:00Z");
    ingest(&store, &common::fleet_batch("b1", "2026-05-01T06:00:00Z", false), at);
    ingest(&store, &common::events_batch(), at);
    reconcile(&store, at);
    let new = NewIncident::from_raw("api down", "warning", "api", ts("2026-04-28T10:00:00Z"))
        .unwrap();
    create_incident(&store, &new, 15).unwrap();

    let pass = track_updates(&store, &UpdatesConfig::default()).unwrap();
    assert_eq!(pass.checked, 2);
    assert_eq!(pass.pending, 1);
    let api = pass.statuses.iter().find(|s| s.service == "api").unwrap();
    assert_eq!(api.status, UpdateState::UpdateAvailable);
    assert_eq!(api.risk, RiskTier::High.elevated());
    let web = pass.statuses.iter().find(|s| s.service == "web").unwrap();
    assert_eq!(web.status, UpdateState::UpToDate);
    assert_eq!(web.risk, RiskTier::Low);

    let backlog = load_update_backlog(&store).unwrap();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].service, "api");

    let health = load_platform_health(&store, at).unwrap();
    assert_eq!(health.active_drift, 2);
    assert_eq!(health.oom_events_24h, 1);
    assert_eq!(health.pending_updates, 1);
    assert_eq!(health.avg_disk_pct_24h, Some(88.0));
    assert!(health.degraded_services.is_empty());
}

#[test]
fn worker_seven_crash_loop_from_ingested_events() {
    let store = Store::open_in_memory().unwrap();
    let now = ts("2026-05-01T07:00:00Z");
    ingest(&store, &common::crash_loop_batch(), now);

    let loops = load_crash_loops(&store, &CrashLoopConfig::default(), now).unwrap();
    assert_eq!(loops.len(), 1);
    assert_eq!(loops[0].entity, "worker-7");
    assert_eq!(loops[0].host, "node-2");
    assert_eq!(loops[0].restart_count, 4);
    assert!((loops[0].span_minutes - 45.0).abs() < 1e-9);

    let quiet = load_crash_loops(&store, &CrashLoopConfig::default(), now + Duration::hours(2));
    assert!(quiet.unwrap().is_empty());
}

#[test]
fn on_disk_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/dlg.sqlite3");
    let at = ts("2026-05-01T06:00:00Z");
    {
        let store = Store::open(&path).unwrap();
        ingest(&store, &common::fleet_batch("b1", "2026-05-01T06:00:00Z", false), at);
        reconcile(&store, at);
    }
    let store = Store::open(&path).unwrap();
    assert!(store.is_wal_mode());
    assert_eq!(store.open_drift().unwrap().len(), 2);
}
