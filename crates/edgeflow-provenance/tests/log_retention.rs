use std::sync::Arc;
use std::time::Duration;

use edgeflow_core::clock::ManualClock;
use edgeflow_core::config::ProvenanceConfig;
use edgeflow_core::types::RecordId;
use edgeflow_provenance::{ProvenanceLog, ProvenanceReporter, RecordSnapshot, RetentionPolicy};

#[test]
fn test_log_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("provenance").join("provenance.db");
    let clock = Arc::new(ManualClock::new(1_000));
    let policy = RetentionPolicy::from(&ProvenanceConfig::default());
    let record = RecordId::new();

    {
        let log = ProvenanceLog::open(&path, policy, clock.clone()).unwrap();
        let mut reporter = ProvenanceReporter::new("gen", "GenerateRecords", clock.clone());
        reporter.create(RecordSnapshot::new(record), None);
        reporter.route(RecordSnapshot::new(record), "success", None);
        assert_eq!(log.append_batch(&reporter.take_events()).unwrap(), 2);
    }

    let log = ProvenanceLog::open(&path, policy, clock).unwrap();
    let events = log.events_for_record(&record).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type().as_str(), "CREATE");
    assert_eq!(events[1].event_type().as_str(), "ROUTE");
}

#[test]
fn test_default_policy_matches_repository_defaults() {
    let policy = RetentionPolicy::from(&ProvenanceConfig::default());
    assert_eq!(policy.max_storage_bytes, 10 * 1024 * 1024);
    assert_eq!(policy.max_age_ms, 60_000);
    assert_eq!(policy.purge_interval, Duration::from_millis(2_500));
}

#[test]
fn test_purge_keeps_recent_events_under_cap() {
    let clock = Arc::new(ManualClock::new(0));
    let policy = RetentionPolicy {
        max_age_ms: 1_000,
        max_storage_bytes: u64::MAX,
        purge_interval: Duration::from_secs(60),
    };
    let log = ProvenanceLog::in_memory(policy, clock.clone()).unwrap();

    let mut reporter = ProvenanceReporter::new("gen", "GenerateRecords", clock.clone());
    for _ in 0..5 {
        reporter.create(RecordSnapshot::new(RecordId::new()), None);
    }
    log.append_batch(&reporter.take_events()).unwrap();

    clock.set(900);
    assert_eq!(log.purge().unwrap(), 0);

    clock.set(1_500);
    for _ in 0..3 {
        reporter.create(RecordSnapshot::new(RecordId::new()), None);
    }
    log.append_batch(&reporter.take_events()).unwrap();

    assert_eq!(log.purge().unwrap(), 5);
    assert_eq!(log.stats().unwrap().events, 3);
}

#[tokio::test]
async fn test_shutdown_without_reclaimer_is_noop() {
    let clock = Arc::new(ManualClock::new(0));
    let log = ProvenanceLog::in_memory(RetentionPolicy::from(&ProvenanceConfig::default()), clock).unwrap();
    log.shutdown().await;
    assert_eq!(log.stats().unwrap().events, 0);
}
