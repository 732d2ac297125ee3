use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique record identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Provenance event identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Index of a processor in the flow graph arena.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ProcessorId(pub usize);

impl std::fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "processor#{}", self.0)
    }
}

/// Index of a connection in the flow graph arena.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ConnectionId(pub usize);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection#{}", self.0)
    }
}

/// Named output of a processor. Connections service exactly one relationship.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Relationship {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Relationship {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    pub fn success() -> Self {
        Self::new("success", "Records processed successfully")
    }

    pub fn failure() -> Self {
        Self::new("failure", "Records that could not be processed")
    }
}

impl std::fmt::Display for Relationship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Well-known record attribute keys.
pub mod attributes {
    pub const FILENAME: &str = "filename";
    pub const PATH: &str = "path";
    pub const ABSOLUTE_PATH: &str = "absolute.path";
    pub const MIME_TYPE: &str = "mime.type";
    pub const PRIORITY: &str = "priority";
    pub const UUID: &str = "uuid";
    pub const DISCARD_REASON: &str = "discard.reason";
    pub const ALTERNATE_IDENTIFIER: &str = "alternate.identifier";

    pub const DEFAULT_PATH: &str = "./";
}

/// Hands out record identities plus a process-local sequence number.
///
/// Owned by the engine context rather than a process-wide static, so two
/// engines in one process never share counters.
#[derive(Debug, Default)]
pub struct IdGenerator {
    sequence: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_record(&self) -> (RecordId, u64) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        (RecordId::new(), seq)
    }

    pub fn issued(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

/// Lifecycle notifications published on the engine's event bus.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    EngineStarted {
        processors: usize,
        connections: usize,
    },
    EngineStopped,
    ProcessorScheduled {
        processor: String,
        strategy: String,
    },
    ProcessorScheduleFailed {
        processor: String,
        error: String,
    },
    ProcessorYielded {
        processor: String,
        until_millis: u64,
    },
    SessionCommitted {
        processor: String,
        transferred: usize,
        dropped: usize,
    },
    SessionRolledBack {
        processor: String,
        error: String,
    },
    BackpressureViolation {
        processor: String,
        connection: String,
        queued: usize,
        queued_bytes: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_roundtrip_from_str() {
        let id = RecordId::new();
        let parsed: RecordId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_id_generator_sequence() {
        let ids = IdGenerator::new();
        let (a, seq_a) = ids.next_record();
        let (b, seq_b) = ids.next_record();
        assert_ne!(a, b);
        assert_eq!(seq_a + 1, seq_b);
        assert_eq!(ids.issued(), 2);
    }

    #[test]
    fn test_relationship_display() {
        assert_eq!(Relationship::success().to_string(), "success");
        assert_eq!(Relationship::failure().name, "failure");
    }
}
