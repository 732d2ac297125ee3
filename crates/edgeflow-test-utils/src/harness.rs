use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use edgeflow_content::ContentStore;
use edgeflow_core::clock::{ManualClock, SystemClock};
use edgeflow_core::config::{EngineConfig, ProvenanceConfig};
use edgeflow_core::event::EventBus;
use edgeflow_core::traits::Clock;
use edgeflow_core::types::RecordId;
use edgeflow_engine::{FlowEngine, FlowEngineBuilder};
use edgeflow_provenance::{ProvenanceEvent, ProvenanceLog, RetentionPolicy};

/// Build a property map from string pairs.
pub fn properties(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Temporary content store, in-memory provenance log and event bus, wired
/// into a `FlowEngineBuilder` on demand.
pub struct TestHarness {
    dir: TempDir,
    clock: Arc<dyn Clock>,
    manual: Option<Arc<ManualClock>>,
    content: Arc<ContentStore>,
    provenance: Arc<ProvenanceLog>,
    events: Arc<EventBus>,
}

impl TestHarness {
    /// Harness on the system clock, for tests that let the scheduler run.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), None)
    }

    /// Harness on a manual clock, for tests that drive sessions by hand.
    pub fn with_manual_clock(start_millis: u64) -> Self {
        let manual = Arc::new(ManualClock::new(start_millis));
        Self::with_clock(manual.clone(), Some(manual))
    }

    fn with_clock(clock: Arc<dyn Clock>, manual: Option<Arc<ManualClock>>) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let content = ContentStore::open(&dir.path().join("content")).expect("open content store");
        let policy = RetentionPolicy {
            purge_interval: Duration::from_millis(50),
            ..RetentionPolicy::from(&ProvenanceConfig::default())
        };
        let provenance = ProvenanceLog::in_memory(policy, clock.clone()).expect("open provenance log");
        Self {
            dir,
            clock,
            manual,
            content,
            provenance,
            events: Arc::new(EventBus::default()),
        }
    }

    /// Builder carrying this harness's services and small worker pools.
    pub fn builder(&self) -> FlowEngineBuilder {
        let engine = EngineConfig {
            content_dir: self.dir.path().join("content").display().to_string(),
            timer_driven_threads: 4,
            event_driven_threads: 4,
            content_cleanup_interval_ms: 50,
        };
        FlowEngine::builder()
            .engine_config(engine)
            .clock(self.clock.clone())
            .content_store(self.content.clone())
            .provenance_log(self.provenance.clone())
            .event_bus(self.events.clone())
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The manual clock, when the harness was built with one.
    pub fn manual_clock(&self) -> Option<&Arc<ManualClock>> {
        self.manual.as_ref()
    }

    /// Move the manual clock forward. No-op on the system clock.
    pub fn advance(&self, millis: u64) {
        if let Some(clock) = &self.manual {
            clock.advance(millis);
        }
    }

    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    pub fn provenance(&self) -> &Arc<ProvenanceLog> {
        &self.provenance
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn lineage(&self, record: RecordId) -> Vec<ProvenanceEvent> {
        self.provenance
            .events_for_record(&record)
            .expect("query provenance")
    }

    /// Number of blobs currently stored.
    pub fn blob_count(&self) -> usize {
        std::fs::read_dir(self.content.directory())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
