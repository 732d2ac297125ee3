use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level flow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub provenance: ProvenanceConfig,
    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

/// Engine-wide settings: content location and worker pool sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_content_dir")]
    pub content_dir: String,
    /// Worker threads shared by all timer-driven processors.
    #[serde(default = "default_timer_driven_threads")]
    pub timer_driven_threads: usize,
    /// Worker threads shared by all event-driven processors.
    #[serde(default = "default_event_driven_threads")]
    pub event_driven_threads: usize,
    /// How often claims whose deletion failed are retried.
    #[serde(default = "default_content_cleanup_interval_ms")]
    pub content_cleanup_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            content_dir: default_content_dir(),
            timer_driven_threads: default_timer_driven_threads(),
            event_driven_threads: default_event_driven_threads(),
            content_cleanup_interval_ms: default_content_cleanup_interval_ms(),
        }
    }
}

impl EngineConfig {
    pub fn content_dir(&self) -> PathBuf {
        expand_home(&self.content_dir)
    }

    pub fn content_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.content_cleanup_interval_ms)
    }
}

fn default_content_dir() -> String { "./content_repository".to_string() }
fn default_timer_driven_threads() -> usize { 4 }
fn default_event_driven_threads() -> usize { 2 }
fn default_content_cleanup_interval_ms() -> u64 { 5_000 }

/// Provenance log location and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceConfig {
    #[serde(default = "default_provenance_db_path")]
    pub db_path: String,
    /// Total encoded event bytes kept before oldest-first purging.
    #[serde(default = "default_max_storage_bytes")]
    pub max_storage_bytes: u64,
    /// Events older than this are purged.
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,
}

impl Default for ProvenanceConfig {
    fn default() -> Self {
        Self {
            db_path: default_provenance_db_path(),
            max_storage_bytes: default_max_storage_bytes(),
            max_age_ms: default_max_age_ms(),
            purge_interval_ms: default_purge_interval_ms(),
        }
    }
}

impl ProvenanceConfig {
    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.db_path)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

fn default_provenance_db_path() -> String { "./provenance_repository/provenance.db".to_string() }
fn default_max_storage_bytes() -> u64 { 10 * 1024 * 1024 }
fn default_max_age_ms() -> u64 { 60_000 }
fn default_purge_interval_ms() -> u64 { 2_500 }

/// How a processor gets triggered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// Fixed period between trigger attempts.
    #[default]
    TimerDriven,
    /// Triggered when an upstream connection signals new work.
    EventDriven,
}

impl std::fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingStrategy::TimerDriven => write!(f, "timer_driven"),
            SchedulingStrategy::EventDriven => write!(f, "event_driven"),
        }
    }
}

/// Per-processor scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulingConfig {
    #[serde(default)]
    pub strategy: SchedulingStrategy,
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Cooldown after the processor yields or fails.
    #[serde(default = "default_yield_period_ms")]
    pub yield_period_ms: u64,
    /// Default applied to records the processor penalizes.
    #[serde(default = "default_penalization_period_ms")]
    pub penalization_period_ms: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            strategy: SchedulingStrategy::default(),
            period_ms: default_period_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            yield_period_ms: default_yield_period_ms(),
            penalization_period_ms: default_penalization_period_ms(),
        }
    }
}

impl SchedulingConfig {
    pub fn timer_driven(period_ms: u64) -> Self {
        Self {
            strategy: SchedulingStrategy::TimerDriven,
            period_ms,
            ..Self::default()
        }
    }

    pub fn event_driven() -> Self {
        Self {
            strategy: SchedulingStrategy::EventDriven,
            ..Self::default()
        }
    }

    pub fn with_max_concurrent_tasks(mut self, tasks: usize) -> Self {
        self.max_concurrent_tasks = tasks.max(1);
        self
    }

    pub fn with_yield_period_ms(mut self, millis: u64) -> Self {
        self.yield_period_ms = millis;
        self
    }

    pub fn with_penalization_period_ms(mut self, millis: u64) -> Self {
        self.penalization_period_ms = millis;
        self
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

fn default_period_ms() -> u64 { 1_000 }
fn default_max_concurrent_tasks() -> usize { 1 }
fn default_yield_period_ms() -> u64 { 1_000 }
fn default_penalization_period_ms() -> u64 { 30_000 }

/// One processor node in the flow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub name: String,
    /// Implementation name, resolved by the caller building the engine.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Relationships whose records are dropped instead of routed.
    #[serde(default)]
    pub auto_terminate: Vec<String>,
}

/// One queue between two processors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default = "default_relationship")]
    pub relationship: String,
    #[serde(default)]
    pub destination: String,
    /// Maximum queued records (0 = unbounded).
    #[serde(default)]
    pub max_queue_count: usize,
    /// Maximum queued content bytes (0 = unbounded).
    #[serde(default)]
    pub max_queue_bytes: u64,
    /// Records older than this are expired on dequeue (0 = never).
    #[serde(default)]
    pub expiration_ms: u64,
}

impl ConnectionConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: String::new(),
            relationship: default_relationship(),
            destination: String::new(),
            max_queue_count: 0,
            max_queue_bytes: 0,
            expiration_ms: 0,
        }
    }

    pub fn with_max_queue_count(mut self, count: usize) -> Self {
        self.max_queue_count = count;
        self
    }

    pub fn with_max_queue_bytes(mut self, bytes: u64) -> Self {
        self.max_queue_bytes = bytes;
        self
    }

    pub fn with_expiration_ms(mut self, millis: u64) -> Self {
        self.expiration_ms = millis;
        self
    }
}

fn default_relationship() -> String { "success".to_string() }

impl FlowConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: FlowConfig =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that names are unique and every connection joins declared processors.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for p in &self.processors {
            if p.name.trim().is_empty() {
                return Err(FlowError::Config("processor with empty name".to_string()));
            }
            if !names.insert(p.name.as_str()) {
                return Err(FlowError::Config(format!(
                    "duplicate processor name '{}'",
                    p.name
                )));
            }
            if p.scheduling.max_concurrent_tasks == 0 {
                return Err(FlowError::Config(format!(
                    "processor '{}' must allow at least one concurrent task",
                    p.name
                )));
            }
        }

        let mut connection_names = HashSet::new();
        for c in &self.connections {
            if !connection_names.insert(c.name.as_str()) {
                return Err(FlowError::Config(format!(
                    "duplicate connection name '{}'",
                    c.name
                )));
            }
            for endpoint in [&c.source, &c.destination] {
                if !names.contains(endpoint.as_str()) {
                    return Err(FlowError::Config(format!(
                        "connection '{}' references unknown processor '{}'",
                        c.name, endpoint
                    )));
                }
            }
        }

        if self.engine.timer_driven_threads == 0 || self.engine.event_driven_threads == 0 {
            return Err(FlowError::Config(
                "worker thread counts must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var("HOME").ok().map(PathBuf::from) {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_EDGEFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_EDGEFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_EDGEFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_EDGEFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_EDGEFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: FlowConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.content_dir, "./content_repository");
        assert_eq!(config.engine.timer_driven_threads, 4);
        assert_eq!(config.provenance.max_storage_bytes, 10 * 1024 * 1024);
        assert_eq!(config.provenance.max_age_ms, 60_000);
        assert_eq!(config.provenance.purge_interval_ms, 2_500);
        assert!(config.processors.is_empty());
    }

    #[test]
    fn test_scheduling_defaults() {
        let toml_str = r#"
[[processors]]
name = "gen"
type = "GenerateRecords"
"#;
        let config: FlowConfig = toml::from_str(toml_str).unwrap();
        let s = &config.processors[0].scheduling;
        assert_eq!(s.strategy, SchedulingStrategy::TimerDriven);
        assert_eq!(s.period_ms, 1_000);
        assert_eq!(s.max_concurrent_tasks, 1);
        assert_eq!(s.penalization_period_ms, 30_000);
    }

    #[test]
    fn test_validate_rejects_unknown_endpoint() {
        let toml_str = r#"
[[processors]]
name = "gen"
type = "GenerateRecords"

[[connections]]
name = "gen-to-nowhere"
source = "gen"
destination = "missing"
"#;
        let config: FlowConfig = toml::from_str(toml_str).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_validate_rejects_duplicate_processor() {
        let toml_str = r#"
[[processors]]
name = "gen"
type = "A"

[[processors]]
name = "gen"
type = "B"
"#;
        let config: FlowConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connection_builder() {
        let c = ConnectionConfig::named("q")
            .with_max_queue_count(10)
            .with_max_queue_bytes(1024)
            .with_expiration_ms(500);
        assert_eq!(c.relationship, "success");
        assert_eq!(c.max_queue_count, 10);
        assert_eq!(c.max_queue_bytes, 1024);
        assert_eq!(c.expiration_ms, 500);
    }
}
