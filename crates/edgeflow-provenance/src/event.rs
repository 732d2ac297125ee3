use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use edgeflow_core::error::Result;
use edgeflow_core::types::{EventId, RecordId};

/// Lifecycle transition recorded for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvenanceEventType {
    /// Record generated from data not received from an external system.
    Create,
    /// Record introduced from an external source.
    Receive,
    /// Existing record's content replaced from an external resource.
    Fetch,
    /// Record sent to an external destination.
    Send,
    /// Content downloaded by a user or external entity.
    Download,
    /// End of life for a reason other than expiration.
    Drop,
    /// End of life because it was not processed in time.
    Expire,
    /// One or more records derived from a parent.
    Fork,
    /// One record derived from several parents.
    Join,
    /// Exact duplicate of a parent.
    Clone,
    ContentModified,
    AttributesModified,
    /// Routed to a relationship.
    Route,
    /// Extra linkage information (alternate identifier, URI).
    #[serde(rename = "ADDINFO")]
    AddInfo,
    /// Re-queued copy of an earlier record.
    Replay,
}

impl ProvenanceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Receive => "RECEIVE",
            Self::Fetch => "FETCH",
            Self::Send => "SEND",
            Self::Download => "DOWNLOAD",
            Self::Drop => "DROP",
            Self::Expire => "EXPIRE",
            Self::Fork => "FORK",
            Self::Join => "JOIN",
            Self::Clone => "CLONE",
            Self::ContentModified => "CONTENT_MODIFIED",
            Self::AttributesModified => "ATTRIBUTES_MODIFIED",
            Self::Route => "ROUTE",
            Self::AddInfo => "ADDINFO",
            Self::Replay => "REPLAY",
        }
    }
}

impl std::fmt::Display for ProvenanceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state of a record at the moment an event was reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub record_id: RecordId,
    pub attributes: BTreeMap<String, String>,
    pub size: u64,
    pub offset: u64,
    pub entry_date: u64,
    pub lineage_start: u64,
    #[serde(default)]
    pub lineage_identifiers: BTreeSet<RecordId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_location: Option<String>,
}

impl RecordSnapshot {
    /// Bare snapshot with no attributes or content.
    pub fn new(record_id: RecordId) -> Self {
        Self {
            record_id,
            attributes: BTreeMap::new(),
            size: 0,
            offset: 0,
            entry_date: 0,
            lineage_start: 0,
            lineage_identifiers: BTreeSet::new(),
            content_location: None,
        }
    }
}

/// Immutable provenance record.
///
/// Built by a `ProvenanceReporter`, persisted on session commit, and never
/// changed afterwards; there are no setters, only constructors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    event_id: EventId,
    event_type: ProvenanceEventType,
    timestamp: u64,
    component_id: String,
    component_type: String,
    record: RecordSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    relationship: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transit_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    parent_ids: Vec<RecordId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    child_ids: Vec<RecordId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// Optional parts of an event, filled in by the reporter helpers.
#[derive(Debug, Clone, Default)]
pub struct EventDetail {
    pub relationship: Option<String>,
    pub transit_uri: Option<String>,
    pub parent_ids: Vec<RecordId>,
    pub child_ids: Vec<RecordId>,
    pub details: Option<String>,
}

impl ProvenanceEvent {
    pub fn new(
        event_type: ProvenanceEventType,
        component_id: impl Into<String>,
        component_type: impl Into<String>,
        record: RecordSnapshot,
        timestamp: u64,
        detail: EventDetail,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type,
            timestamp,
            component_id: component_id.into(),
            component_type: component_type.into(),
            record,
            relationship: detail.relationship,
            transit_uri: detail.transit_uri,
            parent_ids: detail.parent_ids,
            child_ids: detail.child_ids,
            details: detail.details,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> ProvenanceEventType {
        self.event_type
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub fn component_type(&self) -> &str {
        &self.component_type
    }

    pub fn record(&self) -> &RecordSnapshot {
        &self.record
    }

    pub fn record_id(&self) -> RecordId {
        self.record.record_id
    }

    pub fn relationship(&self) -> Option<&str> {
        self.relationship.as_deref()
    }

    pub fn transit_uri(&self) -> Option<&str> {
        self.transit_uri.as_deref()
    }

    pub fn parent_ids(&self) -> &[RecordId] {
        &self.parent_ids
    }

    pub fn child_ids(&self) -> &[RecordId] {
        &self.child_ids
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Serialized form stored in the log.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProvenanceEvent {
        let parent = RecordId::new();
        let mut record = RecordSnapshot::new(RecordId::new());
        record.attributes.insert("filename".to_string(), "a.txt".to_string());
        record.size = 12;
        record.lineage_identifiers.insert(parent);
        record.content_location = Some("/tmp/content/abc".to_string());
        ProvenanceEvent::new(
            ProvenanceEventType::Fork,
            "split",
            "SplitText",
            record,
            1_000,
            EventDetail {
                relationship: Some("success".to_string()),
                transit_uri: None,
                parent_ids: vec![parent],
                child_ids: vec![RecordId::new(), RecordId::new()],
                details: Some("split on newline".to_string()),
            },
        )
    }

    #[test]
    fn test_encode_preserves_every_field() {
        let event = sample();
        let decoded = ProvenanceEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.child_ids().len(), 2);
        assert_eq!(decoded.relationship(), Some("success"));
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&ProvenanceEventType::ContentModified).unwrap();
        assert_eq!(json, "\"CONTENT_MODIFIED\"");
        assert_eq!(ProvenanceEventType::AddInfo.as_str(), "ADDINFO");
        let json = serde_json::to_string(&ProvenanceEventType::AddInfo).unwrap();
        assert_eq!(json, "\"ADDINFO\"");
        let parsed: ProvenanceEventType = serde_json::from_str("\"EXPIRE\"").unwrap();
        assert_eq!(parsed, ProvenanceEventType::Expire);
    }

    #[test]
    fn test_empty_optionals_are_omitted() {
        let event = ProvenanceEvent::new(
            ProvenanceEventType::Create,
            "gen",
            "GenerateRecords",
            RecordSnapshot::new(RecordId::new()),
            5,
            EventDetail::default(),
        );
        let json = String::from_utf8(event.encode().unwrap()).unwrap();
        assert!(!json.contains("transit_uri"));
        assert!(!json.contains("parent_ids"));
        assert!(!json.contains("details"));
    }
}
