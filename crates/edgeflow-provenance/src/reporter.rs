use std::sync::Arc;

use edgeflow_core::traits::Clock;

use crate::event::{EventDetail, ProvenanceEvent, ProvenanceEventType, RecordSnapshot};

/// Accumulates provenance events for one processing session.
///
/// Nothing reported here is visible to anyone else until the owning session
/// commits and hands the events to the log; a rollback simply clears them.
pub struct ProvenanceReporter {
    component_id: String,
    component_type: String,
    clock: Arc<dyn Clock>,
    events: Vec<ProvenanceEvent>,
}

impl ProvenanceReporter {
    pub fn new(
        component_id: impl Into<String>,
        component_type: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            component_id: component_id.into(),
            component_type: component_type.into(),
            clock,
            events: Vec::new(),
        }
    }

    fn push(&mut self, event_type: ProvenanceEventType, record: RecordSnapshot, detail: EventDetail) {
        let event = ProvenanceEvent::new(
            event_type,
            self.component_id.clone(),
            self.component_type.clone(),
            record,
            self.clock.now_millis(),
            detail,
        );
        self.events.push(event);
    }

    fn with_details(details: Option<&str>) -> EventDetail {
        EventDetail {
            details: details.map(str::to_string),
            ..EventDetail::default()
        }
    }

    fn with_uri(transit_uri: &str, details: Option<&str>) -> EventDetail {
        EventDetail {
            transit_uri: Some(transit_uri.to_string()),
            details: details.map(str::to_string),
            ..EventDetail::default()
        }
    }

    pub fn create(&mut self, record: RecordSnapshot, details: Option<&str>) {
        self.push(ProvenanceEventType::Create, record, Self::with_details(details));
    }

    pub fn receive(&mut self, record: RecordSnapshot, transit_uri: &str, details: Option<&str>) {
        self.push(ProvenanceEventType::Receive, record, Self::with_uri(transit_uri, details));
    }

    pub fn fetch(&mut self, record: RecordSnapshot, transit_uri: &str, details: Option<&str>) {
        self.push(ProvenanceEventType::Fetch, record, Self::with_uri(transit_uri, details));
    }

    pub fn send(&mut self, record: RecordSnapshot, transit_uri: &str, details: Option<&str>) {
        self.push(ProvenanceEventType::Send, record, Self::with_uri(transit_uri, details));
    }

    pub fn download(&mut self, record: RecordSnapshot, transit_uri: &str, details: Option<&str>) {
        self.push(ProvenanceEventType::Download, record, Self::with_uri(transit_uri, details));
    }

    pub fn drop_record(&mut self, record: RecordSnapshot, reason: &str) {
        self.push(
            ProvenanceEventType::Drop,
            record,
            Self::with_details(Some(&format!("Discard reason: {}", reason))),
        );
    }

    pub fn expire(&mut self, record: RecordSnapshot, details: Option<&str>) {
        self.push(ProvenanceEventType::Expire, record, Self::with_details(details));
    }

    /// `children` were derived from `parent`.
    pub fn fork(&mut self, parent: RecordSnapshot, children: &[RecordSnapshot], details: Option<&str>) {
        if children.is_empty() {
            return;
        }
        let detail = EventDetail {
            parent_ids: vec![parent.record_id],
            child_ids: children.iter().map(|c| c.record_id).collect(),
            details: details.map(str::to_string),
            ..EventDetail::default()
        };
        self.push(ProvenanceEventType::Fork, parent, detail);
    }

    /// `child` was built by joining `parents`.
    pub fn join(&mut self, parents: &[RecordSnapshot], child: RecordSnapshot, details: Option<&str>) {
        let detail = EventDetail {
            parent_ids: parents.iter().map(|p| p.record_id).collect(),
            child_ids: vec![child.record_id],
            details: details.map(str::to_string),
            ..EventDetail::default()
        };
        self.push(ProvenanceEventType::Join, child, detail);
    }

    pub fn clone_record(&mut self, parent: RecordSnapshot, child: &RecordSnapshot) {
        let detail = EventDetail {
            parent_ids: vec![parent.record_id],
            child_ids: vec![child.record_id],
            ..EventDetail::default()
        };
        self.push(ProvenanceEventType::Clone, parent, detail);
    }

    pub fn modify_content(&mut self, record: RecordSnapshot, details: Option<&str>) {
        self.push(ProvenanceEventType::ContentModified, record, Self::with_details(details));
    }

    pub fn modify_attributes(&mut self, record: RecordSnapshot, details: Option<&str>) {
        self.push(ProvenanceEventType::AttributesModified, record, Self::with_details(details));
    }

    pub fn route(&mut self, record: RecordSnapshot, relationship: &str, details: Option<&str>) {
        let detail = EventDetail {
            relationship: Some(relationship.to_string()),
            details: details.map(str::to_string),
            ..EventDetail::default()
        };
        self.push(ProvenanceEventType::Route, record, detail);
    }

    /// Link `record` to an identifier known outside the flow.
    pub fn add_info(&mut self, record: RecordSnapshot, alternate_uri: &str) {
        self.push(ProvenanceEventType::AddInfo, record, Self::with_uri(alternate_uri, None));
    }

    pub fn replay(&mut self, original: RecordSnapshot, replayed: &RecordSnapshot) {
        let detail = EventDetail {
            parent_ids: vec![original.record_id],
            child_ids: vec![replayed.record_id],
            ..EventDetail::default()
        };
        self.push(ProvenanceEventType::Replay, original, detail);
    }

    pub fn events(&self) -> &[ProvenanceEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<ProvenanceEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
