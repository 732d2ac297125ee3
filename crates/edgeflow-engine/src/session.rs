use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use edgeflow_core::error::{FlowError, Result};
use edgeflow_core::types::{ConnectionId, FlowEvent, RecordId, Relationship};
use edgeflow_provenance::{ProvenanceReporter, RecordSnapshot};

use crate::connection::Connection;
use crate::engine::EngineContext;
use crate::node::ProcessorPorts;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Committed,
    RolledBack,
}

/// What a successful commit did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Records enqueued downstream, fan-out copies included.
    pub transferred: usize,
    pub dropped: usize,
    pub expired: usize,
    pub backpressure_violations: usize,
}

/// A record taken off an input, kept as it was so rollback can put it back.
struct Dequeued {
    connection: ConnectionId,
    original: Record,
    expired: bool,
}

struct Transfer {
    record: Record,
    relationships: Vec<String>,
}

/// Opens sessions for one processor. Handed to `Processor::on_schedule`.
#[derive(Clone)]
pub struct SessionFactory {
    ctx: Arc<EngineContext>,
    ports: Arc<ProcessorPorts>,
}

impl SessionFactory {
    pub(crate) fn new(ctx: Arc<EngineContext>, ports: Arc<ProcessorPorts>) -> Self {
        Self { ctx, ports }
    }

    pub fn processor(&self) -> &str {
        self.ports.name()
    }

    pub fn create_session(&self) -> ProcessSession {
        ProcessSession::new(Arc::clone(&self.ctx), Arc::clone(&self.ports))
    }
}

/// Transactional unit of work for one trigger invocation.
///
/// Everything a processor does through the session stays private until
/// `commit`: records it takes are still recoverable, records it creates are
/// invisible downstream, and provenance sits in the reporter. `rollback`
/// (or dropping an open session) puts every taken record back at the head of
/// its connection in the original order and discards the rest.
///
/// Records move by value. A processor holding a `Record` owns it until it
/// hands it back with `transfer` or `remove`.
pub struct ProcessSession {
    ctx: Arc<EngineContext>,
    ports: Arc<ProcessorPorts>,
    reporter: ProvenanceReporter,
    state: SessionState,
    dequeued: Vec<Dequeued>,
    held: HashSet<RecordId>,
    created: HashMap<RecordId, RecordSnapshot>,
    transfers: Vec<Transfer>,
    removed: Vec<Record>,
    attributes_modified: HashSet<RecordId>,
    content_modified: HashSet<RecordId>,
}

impl ProcessSession {
    pub(crate) fn new(ctx: Arc<EngineContext>, ports: Arc<ProcessorPorts>) -> Self {
        let reporter = ProvenanceReporter::new(
            ports.name.clone(),
            ports.type_name.clone(),
            Arc::clone(ctx.clock()),
        );
        Self {
            ctx,
            ports,
            reporter,
            state: SessionState::Open,
            dequeued: Vec::new(),
            held: HashSet::new(),
            created: HashMap::new(),
            transfers: Vec::new(),
            removed: Vec::new(),
            attributes_modified: HashSet::new(),
            content_modified: HashSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(FlowError::SessionClosed)
        }
    }

    fn ensure_held(&self, record: &Record) -> Result<()> {
        self.ensure_open()?;
        if self.held.contains(&record.id()) {
            Ok(())
        } else {
            Err(FlowError::UnknownRecord(record.id().to_string()))
        }
    }

    fn now(&self) -> u64 {
        self.ctx.clock().now_millis()
    }

    /// Reporter for events the processor raises itself (SEND, RECEIVE, ...).
    pub fn provenance(&mut self) -> &mut ProvenanceReporter {
        &mut self.reporter
    }

    /// Next eligible record from the processor's inputs, visiting them round
    /// robin. Expired records met on the way are kept by the session and
    /// reported at commit.
    pub fn get(&mut self) -> Result<Option<Record>> {
        self.ensure_open()?;
        let inputs = &self.ports.incoming;
        if inputs.is_empty() {
            return Ok(None);
        }

        let start = self.ports.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..inputs.len() {
            let connection = &inputs[(start + i) % inputs.len()];
            let mut expired = Vec::new();
            let next = connection.dequeue(&mut expired);

            for original in expired {
                self.dequeued.push(Dequeued {
                    connection: connection.id(),
                    original,
                    expired: true,
                });
            }

            if let Some(record) = next {
                self.dequeued.push(Dequeued {
                    connection: connection.id(),
                    original: record.duplicate(),
                    expired: false,
                });
                self.held.insert(record.id());
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Up to `max` records, stopping early when the inputs run dry.
    pub fn get_batch(&mut self, max: usize) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while records.len() < max {
            match self.get()? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        Ok(records)
    }

    fn adopt(&mut self, record: &Record) {
        self.created.insert(record.id(), record.snapshot());
        self.held.insert(record.id());
    }

    pub fn create(&mut self) -> Result<Record> {
        self.ensure_open()?;
        let record = Record::new(self.ctx.ids(), self.now());
        self.reporter.create(record.snapshot(), None);
        self.adopt(&record);
        Ok(record)
    }

    /// New record with `parent`'s attributes and lineage but no content.
    pub fn create_child(&mut self, parent: &Record) -> Result<Record> {
        self.ensure_held(parent)?;
        let child = parent.child(self.ctx.ids(), self.now());
        self.reporter
            .fork(parent.snapshot(), std::slice::from_ref(&child.snapshot()), None);
        self.adopt(&child);
        Ok(child)
    }

    /// Copy of `parent` that shares its content claim.
    pub fn clone_record(&mut self, parent: &Record) -> Result<Record> {
        self.ensure_held(parent)?;
        let clone = parent.clone_with_content(self.ctx.ids(), self.now());
        self.reporter.clone_record(parent.snapshot(), &clone.snapshot());
        self.adopt(&clone);
        Ok(clone)
    }

    /// Copy of `parent` that shares its claim but sees only `size` bytes
    /// starting `offset` bytes into `parent`'s content.
    pub fn clone_range(&mut self, parent: &Record, offset: u64, size: u64) -> Result<Record> {
        self.ensure_held(parent)?;
        let end = offset.checked_add(size);
        if end.map_or(true, |end| end > parent.size()) {
            return Err(FlowError::Content(format!(
                "range {}+{} is outside record {} of {} bytes",
                offset,
                size,
                parent.id(),
                parent.size()
            )));
        }
        let mut clone = parent.clone_with_content(self.ctx.ids(), self.now());
        clone.narrow(offset, size);
        self.reporter.clone_record(parent.snapshot(), &clone.snapshot());
        self.adopt(&clone);
        Ok(clone)
    }

    /// New record whose lineage combines every parent.
    pub fn join(&mut self, parents: &[&Record]) -> Result<Record> {
        self.ensure_open()?;
        for parent in parents {
            self.ensure_held(parent)?;
        }
        let mut child = Record::new(self.ctx.ids(), self.now());
        for parent in parents {
            child.extend_lineage(parent);
        }
        let snapshots: Vec<_> = parents.iter().map(|p| p.snapshot()).collect();
        self.reporter.join(&snapshots, child.snapshot(), None);
        self.adopt(&child);
        Ok(child)
    }

    /// Read the record's content window.
    pub fn read<T, F>(&self, record: &Record, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Read) -> Result<T>,
    {
        self.ensure_held(record)?;
        match record.claim() {
            None => f(&mut io::empty()),
            Some(claim) => {
                let mut reader = self
                    .ctx
                    .content()
                    .open_read(claim, record.offset(), record.size())?;
                f(&mut reader)
            }
        }
    }

    /// Replace the record's content. Always writes a fresh claim, so content
    /// shared with other records is never touched.
    pub fn write<F>(&mut self, record: &mut Record, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        self.ensure_held(record)?;
        let content = self.ctx.content();
        let claim = content.create_claim();
        {
            let mut writer = BufWriter::new(content.open_write(&claim)?);
            f(&mut writer)?;
            writer.flush()?;
        }
        let size = content.blob_len(&claim)?;
        record.set_content(claim, 0, size);
        self.content_modified.insert(record.id());
        debug!(processor = %self.ports.name, record = %record.id(), size, "Record content written");
        Ok(())
    }

    /// Replace the record's content with the bytes of a local file.
    pub fn import_from(&mut self, path: &Path, record: &mut Record) -> Result<()> {
        self.write(record, |out| {
            let mut file = File::open(path)?;
            io::copy(&mut file, out)?;
            Ok(())
        })
    }

    /// Write the record's content window to a local file. Returns bytes written.
    pub fn export_to(&self, record: &Record, path: &Path) -> Result<u64> {
        self.read(record, |input| {
            let mut file = File::create(path)?;
            Ok(io::copy(input, &mut file)?)
        })
    }

    pub fn put_attribute(
        &mut self,
        record: &mut Record,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.ensure_held(record)?;
        record.set_attribute(key.into(), value.into());
        self.attributes_modified.insert(record.id());
        Ok(())
    }

    pub fn remove_attribute(&mut self, record: &mut Record, key: &str) -> Result<Option<String>> {
        self.ensure_held(record)?;
        let previous = record.remove_attribute(key);
        if previous.is_some() {
            self.attributes_modified.insert(record.id());
        }
        Ok(previous)
    }

    /// Defer the record for the processor's penalization period.
    pub fn penalize(&mut self, record: &mut Record) -> Result<()> {
        self.ensure_held(record)?;
        let until = self.now() + self.ports.penalization_ms;
        record.set_penalized_until(until);
        debug!(processor = %self.ports.name, record = %record.id(), until, "Record penalized");
        Ok(())
    }

    /// Route the record to one relationship at commit.
    pub fn transfer(&mut self, record: Record, relationship: &Relationship) -> Result<()> {
        self.transfer_all(record, std::slice::from_ref(relationship))
    }

    /// Route the record to several relationships at commit; every connection
    /// beyond the first receives a clone sharing its content.
    pub fn transfer_all(&mut self, record: Record, relationships: &[Relationship]) -> Result<()> {
        self.ensure_held(&record)?;
        if relationships.is_empty() {
            return Err(FlowError::Engine(format!(
                "transfer of record {} names no relationship",
                record.id()
            )));
        }

        let mut names = Vec::with_capacity(relationships.len());
        for relationship in relationships {
            if !self.ports.relationships.contains(&relationship.name) {
                return Err(FlowError::UnknownRelationship {
                    processor: self.ports.name.clone(),
                    relationship: relationship.name.clone(),
                });
            }
            if !names.contains(&relationship.name) {
                names.push(relationship.name.clone());
            }
        }

        self.held.remove(&record.id());
        self.transfers.push(Transfer {
            record,
            relationships: names,
        });
        Ok(())
    }

    /// Drop the record at commit.
    pub fn remove(&mut self, record: Record) -> Result<()> {
        self.ensure_held(&record)?;
        self.held.remove(&record.id());
        self.removed.push(record);
        Ok(())
    }

    fn report_modifications(&mut self, record: &Record) {
        if self.attributes_modified.contains(&record.id()) {
            self.reporter.modify_attributes(record.snapshot(), None);
        }
        if self.content_modified.contains(&record.id()) {
            self.reporter.modify_content(record.snapshot(), None);
        }
    }

    /// Make the session's work visible.
    ///
    /// Provenance is appended in one store transaction before any queue is
    /// touched; if that fails the session rolls back and nothing moves.
    /// Routing problems are reported before anything changes and leave the
    /// session open.
    pub fn commit(&mut self) -> Result<CommitSummary> {
        self.ensure_open()?;

        for transfer in &self.transfers {
            for relationship in &transfer.relationships {
                if self.ports.outgoing(relationship).is_empty()
                    && !self.ports.is_auto_terminated(relationship)
                {
                    return Err(FlowError::UnroutedRelationship {
                        processor: self.ports.name.clone(),
                        relationship: relationship.clone(),
                    });
                }
            }
        }

        let now = self.now();
        let mut summary = CommitSummary::default();
        let mut accounted: HashSet<RecordId> = HashSet::new();
        let mut deliveries: Vec<(Arc<Connection>, Record)> = Vec::new();
        let mut released: Vec<Record> = Vec::new();

        for Transfer {
            record,
            relationships,
        } in std::mem::take(&mut self.transfers)
        {
            accounted.insert(record.id());
            self.report_modifications(&record);

            let mut targets: Vec<Arc<Connection>> = Vec::new();
            for relationship in &relationships {
                self.reporter.route(record.snapshot(), relationship, None);
                targets.extend(self.ports.outgoing(relationship).iter().cloned());
            }

            let mut targets = targets.into_iter();
            let Some(first) = targets.next() else {
                let reason = format!("auto-terminated by {}", relationships.join(","));
                self.reporter.drop_record(record.snapshot(), &reason);
                summary.dropped += 1;
                released.push(record);
                continue;
            };

            for connection in targets {
                let clone = record.clone_with_content(self.ctx.ids(), now);
                self.reporter.clone_record(record.snapshot(), &clone.snapshot());
                deliveries.push((connection, clone));
            }
            deliveries.push((first, record));
        }

        for record in std::mem::take(&mut self.removed) {
            accounted.insert(record.id());
            self.report_modifications(&record);
            self.reporter.drop_record(record.snapshot(), "removed");
            summary.dropped += 1;
            released.push(record);
        }

        for entry in &self.dequeued {
            if entry.expired {
                let details = format!("expired on connection {}", entry.connection);
                self.reporter.expire(entry.original.snapshot(), Some(&details));
                summary.expired += 1;
            } else if !accounted.contains(&entry.original.id()) {
                self.reporter.drop_record(entry.original.snapshot(), "not transferred");
                summary.dropped += 1;
            }
        }

        let mut abandoned: Vec<_> = self
            .created
            .iter()
            .filter(|(id, _)| !accounted.contains(*id))
            .map(|(_, snapshot)| snapshot.clone())
            .collect();
        abandoned.sort_by_key(|s| s.entry_date);
        for snapshot in abandoned {
            self.reporter.drop_record(snapshot, "not transferred");
            summary.dropped += 1;
        }

        let events = self.reporter.take_events();
        if let Err(e) = self.ctx.provenance().append_batch(&events) {
            warn!(processor = %self.ports.name, error = %e, "Provenance append failed, rolling back");
            drop(deliveries);
            self.restore();
            self.state = SessionState::RolledBack;
            return Err(e);
        }

        let mut warned: BTreeSet<ConnectionId> = BTreeSet::new();
        summary.transferred = deliveries.len();
        for (connection, record) in deliveries {
            if connection.is_full() && warned.insert(connection.id()) {
                summary.backpressure_violations += 1;
                warn!(
                    processor = %self.ports.name,
                    connection = %connection.name(),
                    queued = connection.size(),
                    queued_bytes = connection.data_size(),
                    "Transfer into full connection"
                );
                self.ctx.events().publish(FlowEvent::BackpressureViolation {
                    processor: self.ports.name.clone(),
                    connection: connection.name().to_string(),
                    queued: connection.size(),
                    queued_bytes: connection.data_size(),
                });
            }
            connection.enqueue(record);
        }

        self.state = SessionState::Committed;
        self.dequeued.clear();
        self.created.clear();
        self.held.clear();
        self.attributes_modified.clear();
        self.content_modified.clear();
        drop(released);

        debug!(
            processor = %self.ports.name,
            transferred = summary.transferred,
            dropped = summary.dropped,
            expired = summary.expired,
            events = events.len(),
            "Session committed"
        );
        Ok(summary)
    }

    /// Put every taken record back and discard everything else.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.restore();
        self.state = SessionState::RolledBack;
        Ok(())
    }

    fn restore(&mut self) {
        let mut by_connection: BTreeMap<ConnectionId, Vec<Record>> = BTreeMap::new();
        for entry in self.dequeued.drain(..) {
            by_connection
                .entry(entry.connection)
                .or_default()
                .push(entry.original);
        }

        let mut restored = 0;
        for (id, records) in by_connection {
            restored += records.len();
            match self.ports.incoming.iter().find(|c| c.id() == id) {
                Some(connection) => connection.requeue_front(records),
                None => warn!(
                    processor = %self.ports.name,
                    connection = %id,
                    lost = records.len(),
                    "Rollback target connection missing"
                ),
            }
        }

        self.transfers.clear();
        self.removed.clear();
        self.created.clear();
        self.held.clear();
        self.attributes_modified.clear();
        self.content_modified.clear();
        self.reporter.clear();

        debug!(processor = %self.ports.name, restored, "Session rolled back");
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if self.is_open() {
            debug!(processor = %self.ports.name, "Open session dropped");
            self.restore();
            self.state = SessionState::RolledBack;
        }
    }
}
