use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;

use edgeflow_content::ContentClaim;
use edgeflow_core::types::{attributes, ConnectionId, IdGenerator, RecordId};
use edgeflow_provenance::RecordSnapshot;

/// One unit of data plus attributes moving through the flow graph.
///
/// A record is owned by exactly one connection while queued, or by one
/// session while being processed. Records are only built by sessions; a
/// processor can read one freely but must go through its session to change
/// it.
#[derive(Debug)]
pub struct Record {
    id: RecordId,
    sequence: u64,
    entry_date: u64,
    lineage_start: u64,
    last_queue_date: u64,
    penalized_until: u64,
    attributes: BTreeMap<String, String>,
    size: u64,
    offset: u64,
    lineage: BTreeSet<RecordId>,
    claim: Option<ContentClaim>,
    original_connection: Option<ConnectionId>,
}

impl Record {
    /// Fresh record with the default `uuid`, `filename` and `path` attributes.
    pub(crate) fn new(ids: &IdGenerator, now: u64) -> Self {
        let (id, sequence) = ids.next_record();
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();

        let mut attrs = BTreeMap::new();
        attrs.insert(attributes::UUID.to_string(), id.to_string());
        attrs.insert(attributes::FILENAME.to_string(), nanos.to_string());
        attrs.insert(attributes::PATH.to_string(), attributes::DEFAULT_PATH.to_string());

        Self {
            id,
            sequence,
            entry_date: now,
            lineage_start: now,
            last_queue_date: 0,
            penalized_until: 0,
            attributes: attrs,
            size: 0,
            offset: 0,
            lineage: BTreeSet::new(),
            claim: None,
            original_connection: None,
        }
    }

    /// New record descended from `self`: inherits attributes and lineage,
    /// with no content.
    pub(crate) fn child(&self, ids: &IdGenerator, now: u64) -> Self {
        let mut child = Record::new(ids, now);
        for (key, value) in &self.attributes {
            if key != attributes::UUID {
                child.attributes.insert(key.clone(), value.clone());
            }
        }
        child.lineage_start = self.lineage_start;
        child.lineage = self.lineage.clone();
        child.lineage.insert(self.id);
        child
    }

    /// New record sharing `self`'s claim and content window.
    pub(crate) fn clone_with_content(&self, ids: &IdGenerator, now: u64) -> Self {
        let mut clone = self.child(ids, now);
        clone.claim = self.claim.clone();
        clone.size = self.size;
        clone.offset = self.offset;
        clone.penalized_until = self.penalized_until;
        clone
    }

    /// Same identity and state, with another handle on the claim. Used for
    /// the rollback copy a session keeps of every record it dequeues.
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            id: self.id,
            sequence: self.sequence,
            entry_date: self.entry_date,
            lineage_start: self.lineage_start,
            last_queue_date: self.last_queue_date,
            penalized_until: self.penalized_until,
            attributes: self.attributes.clone(),
            size: self.size,
            offset: self.offset,
            lineage: self.lineage.clone(),
            claim: self.claim.clone(),
            original_connection: self.original_connection,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Engine-local creation order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn entry_date(&self) -> u64 {
        self.entry_date
    }

    pub fn lineage_start(&self) -> u64 {
        self.lineage_start
    }

    pub fn last_queue_date(&self) -> u64 {
        self.last_queue_date
    }

    pub fn penalized_until(&self) -> u64 {
        self.penalized_until
    }

    pub fn is_penalized(&self, now: u64) -> bool {
        self.penalized_until > now
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn lineage(&self) -> &BTreeSet<RecordId> {
        &self.lineage
    }

    pub fn claim(&self) -> Option<&ContentClaim> {
        self.claim.as_ref()
    }

    /// Connection this record was last dequeued from.
    pub fn original_connection(&self) -> Option<ConnectionId> {
        self.original_connection
    }

    pub(crate) fn set_attribute(&mut self, key: String, value: String) -> Option<String> {
        self.attributes.insert(key, value)
    }

    pub(crate) fn remove_attribute(&mut self, key: &str) -> Option<String> {
        self.attributes.remove(key)
    }

    pub(crate) fn set_penalized_until(&mut self, until: u64) {
        self.penalized_until = until;
    }

    pub(crate) fn set_last_queue_date(&mut self, now: u64) {
        self.last_queue_date = now;
    }

    pub(crate) fn set_original_connection(&mut self, connection: ConnectionId) {
        self.original_connection = Some(connection);
    }

    pub(crate) fn set_content(&mut self, claim: ContentClaim, offset: u64, size: u64) {
        self.claim = Some(claim);
        self.offset = offset;
        self.size = size;
    }

    pub(crate) fn narrow(&mut self, offset: u64, size: u64) {
        self.offset += offset;
        self.size = size;
    }

    pub(crate) fn extend_lineage(&mut self, other: &Record) {
        self.lineage.extend(other.lineage.iter().copied());
        self.lineage.insert(other.id);
        self.lineage_start = self.lineage_start.min(other.lineage_start);
    }

    /// State reported in provenance events.
    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            record_id: self.id,
            attributes: self.attributes.clone(),
            size: self.size,
            offset: self.offset,
            entry_date: self.entry_date,
            lineage_start: self.lineage_start,
            lineage_identifiers: self.lineage.clone(),
            content_location: self.claim.as_ref().map(|c| c.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeflow_content::ContentStore;

    #[test]
    fn test_new_record_has_default_attributes() {
        let ids = IdGenerator::new();
        let record = Record::new(&ids, 42);
        assert_eq!(record.attribute(attributes::UUID), Some(record.id().to_string().as_str()));
        assert_eq!(record.attribute(attributes::PATH), Some("./"));
        assert!(record.attribute(attributes::FILENAME).is_some());
        assert_eq!(record.entry_date(), 42);
        assert_eq!(record.lineage_start(), 42);
        assert!(record.claim().is_none());
    }

    #[test]
    fn test_child_inherits_attributes_and_lineage() {
        let ids = IdGenerator::new();
        let mut parent = Record::new(&ids, 10);
        parent.set_attribute("color".to_string(), "blue".to_string());

        let child = parent.child(&ids, 20);
        assert_ne!(child.id(), parent.id());
        assert_eq!(child.attribute("color"), Some("blue"));
        assert_eq!(child.attribute(attributes::UUID), Some(child.id().to_string().as_str()));
        assert!(child.lineage().contains(&parent.id()));
        assert_eq!(child.lineage_start(), 10);
        assert_eq!(child.entry_date(), 20);
    }

    #[test]
    fn test_clone_shares_claim_with_own_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let ids = IdGenerator::new();

        let mut parent = Record::new(&ids, 0);
        let claim = store.create_claim();
        std::fs::write(claim.path(), b"0123456789").unwrap();
        parent.set_content(claim, 0, 10);

        let mut clone = parent.clone_with_content(&ids, 0);
        clone.narrow(2, 3);

        let (a, b) = (parent.claim().unwrap(), clone.claim().unwrap());
        assert!(a.same_claim(b));
        assert_eq!(a.owners(), 2);
        assert_eq!((clone.offset(), clone.size()), (2, 3));
        assert_eq!((parent.offset(), parent.size()), (0, 10));
    }

    #[test]
    fn test_snapshot_reports_content_location() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let ids = IdGenerator::new();
        let mut record = Record::new(&ids, 0);
        let claim = store.create_claim();
        let location = claim.to_string();
        record.set_content(claim, 0, 0);

        let snapshot = record.snapshot();
        assert_eq!(snapshot.record_id, record.id());
        assert_eq!(snapshot.content_location.as_deref(), Some(location.as_str()));
    }
}
