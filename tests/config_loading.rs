use std::io::Write;

use edgeflow_core::config::{FlowConfig, SchedulingStrategy};
use edgeflow_core::error::FlowError;

fn write_flow(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_full_flow_from_file() {
    let file = write_flow(
        r#"
[engine]
content_dir = "/var/lib/edgeflow/content"
timer_driven_threads = 8
event_driven_threads = 3
content_cleanup_interval_ms = 1000

[provenance]
db_path = "/var/lib/edgeflow/provenance.db"
max_storage_bytes = 1048576
max_age_ms = 3600000
purge_interval_ms = 10000

[[processors]]
name = "read-sensors"
type = "GenerateRecords"
properties = { "Batch Size" = "10" }

[processors.scheduling]
period_ms = 500
yield_period_ms = 2000

[[processors]]
name = "forward"
type = "PassThrough"
auto_terminate = ["success"]

[processors.scheduling]
strategy = "event_driven"
max_concurrent_tasks = 4
penalization_period_ms = 5000

[[connections]]
name = "readings"
source = "read-sensors"
destination = "forward"
max_queue_count = 10000
max_queue_bytes = 1073741824
expiration_ms = 86400000
"#,
    );

    let config = FlowConfig::load(file.path()).unwrap();
    assert_eq!(config.engine.content_dir, "/var/lib/edgeflow/content");
    assert_eq!(config.engine.timer_driven_threads, 8);
    assert_eq!(config.engine.event_driven_threads, 3);
    assert_eq!(config.engine.content_cleanup_interval().as_millis(), 1000);
    assert_eq!(config.provenance.max_storage_bytes, 1_048_576);
    assert_eq!(config.provenance.max_age_ms, 3_600_000);
    assert_eq!(config.provenance.purge_interval().as_secs(), 10);

    assert_eq!(config.processors.len(), 2);
    let sensors = &config.processors[0];
    assert_eq!(sensors.kind, "GenerateRecords");
    assert_eq!(sensors.scheduling.strategy, SchedulingStrategy::TimerDriven);
    assert_eq!(sensors.scheduling.period_ms, 500);
    assert_eq!(sensors.scheduling.yield_period_ms, 2000);
    assert_eq!(sensors.properties.get("Batch Size").map(String::as_str), Some("10"));

    let forward = &config.processors[1];
    assert_eq!(forward.scheduling.strategy, SchedulingStrategy::EventDriven);
    assert_eq!(forward.scheduling.max_concurrent_tasks, 4);
    assert_eq!(forward.scheduling.penalization_period_ms, 5000);
    assert_eq!(forward.auto_terminate, vec!["success".to_string()]);

    let readings = &config.connections[0];
    assert_eq!(readings.relationship, "success");
    assert_eq!(readings.max_queue_count, 10_000);
    assert_eq!(readings.max_queue_bytes, 1 << 30);
    assert_eq!(readings.expiration_ms, 86_400_000);
}

#[test]
fn test_load_expands_env_vars() {
    std::env::set_var("EDGEFLOW_TEST_CONTENT_DIR", "/tmp/edgeflow-env-content");
    let file = write_flow(
        r#"
[engine]
content_dir = "${EDGEFLOW_TEST_CONTENT_DIR}"
"#,
    );

    let config = FlowConfig::load(file.path()).unwrap();
    assert_eq!(config.engine.content_dir, "/tmp/edgeflow-env-content");
    std::env::remove_var("EDGEFLOW_TEST_CONTENT_DIR");
}

#[test]
fn test_missing_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let err = FlowConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, FlowError::ConfigNotFound(_)));
}

#[test]
fn test_malformed_toml_is_rejected() {
    let file = write_flow("[[processors]\nname = ");
    let err = FlowConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, FlowError::Config(_)));
}

#[test]
fn test_duplicate_connection_names_are_rejected() {
    let file = write_flow(
        r#"
[[processors]]
name = "a"
type = "GenerateRecords"

[[processors]]
name = "b"
type = "PassThrough"

[[connections]]
name = "link"
source = "a"
destination = "b"

[[connections]]
name = "link"
source = "a"
destination = "b"
"#,
    );

    let err = FlowConfig::load(file.path()).unwrap_err();
    assert!(err.to_string().contains("duplicate connection name"));
}

#[test]
fn test_zero_worker_threads_are_rejected() {
    let file = write_flow(
        r#"
[engine]
event_driven_threads = 0
"#,
    );

    let err = FlowConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, FlowError::Config(_)));
}
