use std::collections::BTreeMap;
use std::sync::Arc;

use edgeflow_core::config::{ConnectionConfig, FlowConfig, ProcessorConfig, SchedulingConfig, SchedulingStrategy};
use edgeflow_core::error::{FlowError, Result};
use edgeflow_core::types::Relationship;
use edgeflow_engine::{FlowEngine, Processor};
use edgeflow_test_utils::{CollectSink, GenerateRecords, PassThrough, TestHarness};

const FLOW: &str = r#"
[engine]
timer_driven_threads = 2
event_driven_threads = 2

[[processors]]
name = "generate"
type = "GenerateRecords"
properties = { "Batch Size" = "3", "Content" = "tick" }

[processors.scheduling]
strategy = "timer_driven"
period_ms = 250

[[processors]]
name = "relay"
type = "PassThrough"
auto_terminate = ["success"]

[processors.scheduling]
strategy = "event_driven"
max_concurrent_tasks = 2

[[processors]]
name = "store"
type = "CollectSink"

[[connections]]
name = "generated"
source = "generate"
destination = "relay"
max_queue_count = 100
expiration_ms = 60000

[[connections]]
name = "stored"
source = "generate"
destination = "store"
"#;

fn resolve(entry: &ProcessorConfig) -> Result<Arc<dyn Processor>> {
    match entry.kind.as_str() {
        "GenerateRecords" => Ok(Arc::new(GenerateRecords::new())),
        "PassThrough" => Ok(Arc::new(PassThrough)),
        "CollectSink" => Ok(Arc::new(CollectSink::new())),
        other => Err(FlowError::Config(format!("unknown processor type '{}'", other))),
    }
}

fn parse(text: &str) -> FlowConfig {
    toml::from_str(text).unwrap()
}

#[test]
fn test_from_config_builds_graph() {
    let h = TestHarness::with_manual_clock(0);
    let config = parse(FLOW);
    let engine = FlowEngine::builder_from_config(&config, resolve, h.builder())
        .unwrap()
        .build()
        .unwrap();

    let generate = engine.processor_id("generate").unwrap();
    let relay = engine.processor_id("relay").unwrap();
    let store = engine.processor_id("store").unwrap();
    assert_eq!(engine.connections().len(), 2);

    let generated = engine.connection_by_name("generated").unwrap();
    assert_eq!(generated.source(), generate);
    assert_eq!(generated.destination(), relay);
    assert_eq!(generated.relationship(), "success");
    assert_eq!(generated.max_queue_count(), 100);
    assert_eq!(generated.expiration_ms(), 60_000);
    assert_eq!(engine.connection_by_name("stored").unwrap().destination(), store);

    let relay_ctx = engine.processor_context(relay).unwrap();
    assert_eq!(relay_ctx.scheduling().strategy, SchedulingStrategy::EventDriven);
    assert_eq!(relay_ctx.scheduling().max_concurrent_tasks, 2);
    assert_eq!(relay_ctx.type_name(), "PassThrough");

    let generate_ctx = engine.processor_context(generate).unwrap();
    assert_eq!(generate_ctx.property("Batch Size").as_deref(), Some("3"));
    assert_eq!(generate_ctx.property("Max Records").as_deref(), Some("0"));
    assert_eq!(engine.descriptor(store).unwrap().type_name, "CollectSink");

    // relay's success is auto-terminated, so a commit there drops the record
    let mut source = engine.session_factory(generate).unwrap().create_session();
    let record = source.create().unwrap();
    source.transfer(record, &Relationship::success()).unwrap();
    let summary = source.commit().unwrap();
    assert_eq!(summary.transferred, 2);

    let mut relay_session = engine.session_factory(relay).unwrap().create_session();
    let record = relay_session.get().unwrap().unwrap();
    relay_session.transfer(record, &Relationship::success()).unwrap();
    assert_eq!(relay_session.commit().unwrap().dropped, 1);
}

#[test]
fn test_from_config_rejects_unknown_type() {
    let h = TestHarness::with_manual_clock(0);
    let config = parse(&FLOW.replace("\"PassThrough\"", "\"Mystery\""));
    let err = FlowEngine::builder_from_config(&config, resolve, h.builder()).err().unwrap();
    assert!(err.to_string().contains("Mystery"));
}

#[test]
fn test_from_config_rejects_undeclared_relationship() {
    let h = TestHarness::with_manual_clock(0);
    let mut config = parse(FLOW);
    config.connections[0].relationship = "failure".to_string();
    let err = FlowEngine::builder_from_config(&config, resolve, h.builder()).err().unwrap();
    assert!(matches!(err, FlowError::UnknownRelationship { .. }));
}

#[test]
fn test_builder_rejects_duplicates() {
    let h = TestHarness::with_manual_clock(0);
    let mut builder = h.builder();
    let source = builder
        .add_processor("source", Arc::new(GenerateRecords::new()), SchedulingConfig::default(), BTreeMap::new())
        .unwrap();
    let sink = builder
        .add_processor("sink", Arc::new(CollectSink::new()), SchedulingConfig::default(), BTreeMap::new())
        .unwrap();

    let again = builder.add_processor("source", Arc::new(PassThrough), SchedulingConfig::default(), BTreeMap::new());
    assert!(matches!(again, Err(FlowError::Config(_))));

    builder.connect(source, "success", sink, ConnectionConfig::named("out")).unwrap();
    let again = builder.connect(source, "success", sink, ConnectionConfig::named("out"));
    assert!(matches!(again, Err(FlowError::Config(_))));

    let unknown = builder.auto_terminate(sink, "success");
    assert!(matches!(unknown, Err(FlowError::UnknownRelationship { .. })));

    let zero = SchedulingConfig {
        max_concurrent_tasks: 0,
        ..SchedulingConfig::default()
    };
    let rejected = builder.add_processor("idle", Arc::new(PassThrough), zero, BTreeMap::new());
    assert!(matches!(rejected, Err(FlowError::Config(_))));
}

#[test]
fn test_build_opens_stores_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = parse(FLOW);
    config.engine.content_dir = dir.path().join("content").display().to_string();
    config.provenance.db_path = dir.path().join("provenance").join("events.db").display().to_string();

    let engine = FlowEngine::from_config(&config, resolve).unwrap();
    assert!(dir.path().join("content").is_dir());
    assert!(dir.path().join("provenance").join("events.db").exists());
    assert_eq!(engine.provenance().stats().unwrap().events, 0);
}

#[test]
fn test_drain_discards_queued_records() {
    let h = TestHarness::with_manual_clock(0);
    let config = parse(FLOW);
    let engine = FlowEngine::builder_from_config(&config, resolve, h.builder())
        .unwrap()
        .build()
        .unwrap();
    let generate = engine.processor_id("generate").unwrap();

    let mut session = engine.session_factory(generate).unwrap().create_session();
    for _ in 0..3 {
        let record = session.create().unwrap();
        session.transfer(record, &Relationship::success()).unwrap();
    }
    session.commit().unwrap();
    let events = h.provenance().stats().unwrap().events;

    assert_eq!(engine.drain(), 6);
    assert!(engine.connections().iter().all(|c| c.is_empty()));
    assert_eq!(h.provenance().stats().unwrap().events, events);
}

#[tokio::test]
async fn test_start_twice_fails_and_early_stop_is_noop() {
    let h = TestHarness::new();
    let config = parse(FLOW);
    let engine = FlowEngine::builder_from_config(&config, resolve, h.builder())
        .unwrap()
        .build()
        .unwrap();

    engine.stop().await;
    engine.start().unwrap();
    assert!(matches!(engine.start(), Err(FlowError::Engine(_))));
    engine.stop().await;
}
