use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use edgeflow_core::config::ConnectionConfig;
use edgeflow_core::traits::Clock;
use edgeflow_core::types::{ConnectionId, ProcessorId, RecordId};

use crate::record::Record;

#[derive(Debug, Default)]
struct Queue {
    records: VecDeque<Record>,
    bytes: u64,
}

/// FIFO queue of records between one relationship of a source processor and
/// one destination processor.
///
/// The queue lock is only held for the queue mutation itself. Bounds are
/// advisory: `enqueue` never rejects, sessions check `is_full` and report
/// overruns instead.
pub struct Connection {
    id: ConnectionId,
    name: String,
    relationship: String,
    source: ProcessorId,
    destination: ProcessorId,
    max_queue_count: usize,
    max_queue_bytes: u64,
    expiration_ms: u64,
    clock: Arc<dyn Clock>,
    queue: Mutex<Queue>,
    work: Arc<Notify>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        config: &ConnectionConfig,
        source: ProcessorId,
        destination: ProcessorId,
        clock: Arc<dyn Clock>,
        work: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            name: config.name.clone(),
            relationship: config.relationship.clone(),
            source,
            destination,
            max_queue_count: config.max_queue_count,
            max_queue_bytes: config.max_queue_bytes,
            expiration_ms: config.expiration_ms,
            clock,
            queue: Mutex::new(Queue::default()),
            work,
        }
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn relationship(&self) -> &str {
        &self.relationship
    }

    pub fn source(&self) -> ProcessorId {
        self.source
    }

    pub fn destination(&self) -> ProcessorId {
        self.destination
    }

    pub fn max_queue_count(&self) -> usize {
        self.max_queue_count
    }

    pub fn max_queue_bytes(&self) -> u64 {
        self.max_queue_bytes
    }

    pub fn expiration_ms(&self) -> u64 {
        self.expiration_ms
    }

    /// Append to the tail and wake the destination.
    pub(crate) fn enqueue(&self, mut record: Record) {
        record.set_last_queue_date(self.clock.now_millis());
        {
            let mut queue = self.queue();
            queue.bytes += record.size();
            debug!(
                connection = %self.name,
                record = %record.id(),
                queued = queue.records.len() + 1,
                "Record enqueued"
            );
            queue.records.push_back(record);
        }
        self.work.notify_one();
    }

    /// Take the next eligible record from the head.
    ///
    /// Expired records found at the head are moved into `expired` and the
    /// scan continues. A penalized head stops the scan and stays in place.
    pub(crate) fn dequeue(&self, expired: &mut Vec<Record>) -> Option<Record> {
        let now = self.clock.now_millis();
        let mut queue = self.queue();

        loop {
            let front = queue.records.front()?;

            if self.is_expired(front, now) {
                let mut record = queue.records.pop_front()?;
                queue.bytes = queue.bytes.saturating_sub(record.size());
                record.set_original_connection(self.id);
                debug!(connection = %self.name, record = %record.id(), "Record expired");
                expired.push(record);
                continue;
            }

            if front.is_penalized(now) {
                debug!(
                    connection = %self.name,
                    record = %front.id(),
                    until = front.penalized_until(),
                    "Head record penalized"
                );
                return None;
            }

            let mut record = queue.records.pop_front()?;
            queue.bytes = queue.bytes.saturating_sub(record.size());
            record.set_original_connection(self.id);
            return Some(record);
        }
    }

    /// Put records back at the head, keeping their given order.
    pub(crate) fn requeue_front(&self, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        {
            let mut queue = self.queue();
            for record in records.into_iter().rev() {
                queue.bytes += record.size();
                queue.records.push_front(record);
            }
        }
        self.work.notify_one();
    }

    pub fn is_empty(&self) -> bool {
        self.queue().records.is_empty()
    }

    /// True when a `dequeue` at `now` would hand out or expire the head.
    /// A penalized head that has not expired makes the queue ineligible.
    pub fn has_eligible_head(&self, now: u64) -> bool {
        let queue = self.queue();
        match queue.records.front() {
            Some(front) => self.is_expired(front, now) || !front.is_penalized(now),
            None => false,
        }
    }

    fn is_expired(&self, record: &Record, now: u64) -> bool {
        self.expiration_ms > 0 && now.saturating_sub(record.entry_date()) > self.expiration_ms
    }

    /// True once a configured count or byte bound has been reached.
    pub fn is_full(&self) -> bool {
        let queue = self.queue();
        (self.max_queue_count > 0 && queue.records.len() >= self.max_queue_count)
            || (self.max_queue_bytes > 0 && queue.bytes >= self.max_queue_bytes)
    }

    pub fn size(&self) -> usize {
        self.queue().records.len()
    }

    pub fn data_size(&self) -> u64 {
        self.queue().bytes
    }

    /// Queued record ids, head first.
    pub fn record_ids(&self) -> Vec<RecordId> {
        self.queue().records.iter().map(Record::id).collect()
    }

    /// Visit queued records head first. The queue stays locked meanwhile.
    pub fn for_each(&self, mut f: impl FnMut(&Record)) {
        for record in &self.queue().records {
            f(record);
        }
    }

    /// Discard every queued record without provenance. Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let drained = {
            let mut queue = self.queue();
            queue.bytes = 0;
            std::mem::take(&mut queue.records)
        };
        let count = drained.len();
        if count > 0 {
            debug!(connection = %self.name, count, "Connection drained");
        }
        count
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("relationship", &self.relationship)
            .field("size", &self.size())
            .field("data_size", &self.data_size())
            .finish()
    }
}
