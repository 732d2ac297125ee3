use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use edgeflow_core::config::ProvenanceConfig;
use edgeflow_core::error::{FlowError, Result};
use edgeflow_core::traits::Clock;
use edgeflow_core::types::{EventId, RecordId};

use crate::event::ProvenanceEvent;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS events (
        event_id TEXT PRIMARY KEY,
        record_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        size INTEGER NOT NULL,
        body BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_events_record ON events(record_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);";

/// Retention limits applied by the reclaimer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_ms: u64,
    pub max_storage_bytes: u64,
    pub purge_interval: Duration,
}

impl From<&ProvenanceConfig> for RetentionPolicy {
    fn from(config: &ProvenanceConfig) -> Self {
        Self {
            max_age_ms: config.max_age_ms,
            max_storage_bytes: config.max_storage_bytes,
            purge_interval: config.purge_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub events: u64,
    pub bytes: u64,
}

/// Append-only, retention-bounded provenance event store backed by SQLite.
///
/// Events are keyed by event id and stored as their encoded form. A
/// background reclaimer owned by the log purges events by age and by total
/// size; it is started with `start_reclaimer` and joined by `shutdown`.
pub struct ProvenanceLog {
    conn: Mutex<Connection>,
    policy: RetentionPolicy,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
}

impl ProvenanceLog {
    /// Open or create the provenance database at the given path.
    pub fn open(path: &Path, policy: RetentionPolicy, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create provenance directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| FlowError::Database(e.to_string()))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;

        info!(
            path = %path.display(),
            max_age_ms = policy.max_age_ms,
            max_storage_bytes = policy.max_storage_bytes,
            "Provenance log opened"
        );
        Ok(Self::from_connection(conn, policy, clock))
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory(policy: RetentionPolicy, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory().map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;
        Ok(Self::from_connection(conn, policy, clock))
    }

    fn from_connection(conn: Connection, policy: RetentionPolicy, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            conn: Mutex::new(conn),
            policy,
            clock,
            cancel: CancellationToken::new(),
            reclaimer: Mutex::new(None),
        })
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Persist one event. Returns false when an event with that id already exists.
    pub fn append(&self, event: &ProvenanceEvent) -> Result<bool> {
        let body = event.encode()?;
        let conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO events (event_id, record_id, event_type, timestamp, size, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.event_id().to_string(),
                    event.record_id().to_string(),
                    event.event_type().as_str(),
                    event.timestamp() as i64,
                    body.len() as i64,
                    body,
                ],
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
        Ok(inserted > 0)
    }

    /// Persist a session's events in one transaction: all of them or none.
    pub fn append_batch(&self, events: &[ProvenanceEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let encoded = events
            .iter()
            .map(|e| e.encode().map(|body| (e, body)))
            .collect::<Result<Vec<_>>>()?;

        let mut conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
        let tx = conn.transaction().map_err(|e| FlowError::Database(e.to_string()))?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO events (event_id, record_id, event_type, timestamp, size, body)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(|e| FlowError::Database(e.to_string()))?;
            for (event, body) in &encoded {
                inserted += stmt
                    .execute(params![
                        event.event_id().to_string(),
                        event.record_id().to_string(),
                        event.event_type().as_str(),
                        event.timestamp() as i64,
                        body.len() as i64,
                        body,
                    ])
                    .map_err(|e| FlowError::Database(e.to_string()))?;
            }
        }
        tx.commit().map_err(|e| FlowError::Database(e.to_string()))?;

        debug!(count = inserted, "Provenance events appended");
        Ok(inserted)
    }

    /// Look up one event by id.
    pub fn get(&self, event_id: &EventId) -> Result<Option<ProvenanceEvent>> {
        let conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
        let body: Option<Vec<u8>> = conn
            .query_row(
                "SELECT body FROM events WHERE event_id = ?1",
                params![event_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| FlowError::Database(e.to_string()))?;

        body.map(|b| ProvenanceEvent::decode(&b)).transpose()
    }

    /// Every stored event about one record, oldest first.
    pub fn events_for_record(&self, record_id: &RecordId) -> Result<Vec<ProvenanceEvent>> {
        self.query_bodies(
            "SELECT body FROM events WHERE record_id = ?1 ORDER BY timestamp ASC, rowid ASC",
            params![record_id.to_string()],
        )
    }

    /// The most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ProvenanceEvent>> {
        self.query_bodies(
            "SELECT body FROM events ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    fn query_bodies(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<ProvenanceEvent>> {
        let conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
        let mut stmt = conn.prepare(sql).map_err(|e| FlowError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(args, |row| row.get::<_, Vec<u8>>(0))
            .map_err(|e| FlowError::Database(e.to_string()))?;

        let mut events = Vec::new();
        for row in rows {
            let body = row.map_err(|e| FlowError::Database(e.to_string()))?;
            events.push(ProvenanceEvent::decode(&body)?);
        }
        Ok(events)
    }

    pub fn stats(&self) -> Result<LogStats> {
        let conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM events",
            [],
            |row| {
                Ok(LogStats {
                    events: row.get::<_, i64>(0)? as u64,
                    bytes: row.get::<_, i64>(1)? as u64,
                })
            },
        )
        .map_err(|e| FlowError::Database(e.to_string()))
    }

    /// Delete events past the age limit, then oldest-first until the stored
    /// size is within the cap. Returns the number of events removed.
    pub fn purge(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let cutoff = now.saturating_sub(self.policy.max_age_ms);

        let mut conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
        let tx = conn.transaction().map_err(|e| FlowError::Database(e.to_string()))?;

        let mut removed = tx
            .execute("DELETE FROM events WHERE timestamp < ?1", params![cutoff as i64])
            .map_err(|e| FlowError::Database(e.to_string()))?;

        let total: i64 = tx
            .query_row("SELECT COALESCE(SUM(size), 0) FROM events", [], |row| row.get(0))
            .map_err(|e| FlowError::Database(e.to_string()))?;
        let total = total as u64;

        if total > self.policy.max_storage_bytes {
            let mut excess = total - self.policy.max_storage_bytes;
            let mut victims = Vec::new();
            {
                let mut stmt = tx
                    .prepare("SELECT event_id, size FROM events ORDER BY timestamp ASC, rowid ASC")
                    .map_err(|e| FlowError::Database(e.to_string()))?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                    .map_err(|e| FlowError::Database(e.to_string()))?;
                for row in rows {
                    let (id, size) = row.map_err(|e| FlowError::Database(e.to_string()))?;
                    victims.push(id);
                    let size = size as u64;
                    if size >= excess {
                        break;
                    }
                    excess -= size;
                }
            }
            for id in &victims {
                removed += tx
                    .execute("DELETE FROM events WHERE event_id = ?1", params![id])
                    .map_err(|e| FlowError::Database(e.to_string()))?;
            }
        }

        tx.commit().map_err(|e| FlowError::Database(e.to_string()))?;
        if removed > 0 {
            info!(removed, "Provenance events purged");
        }
        Ok(removed)
    }

    /// Spawn the periodic reclaimer. Must be called inside a tokio runtime.
    ///
    /// The task only holds a weak reference, so dropping the log also ends it.
    pub fn start_reclaimer(self: &Arc<Self>) {
        let mut slot = match self.reclaimer.lock() {
            Ok(slot) => slot,
            Err(e) => {
                error!(error = %e, "Reclaimer slot poisoned");
                return;
            }
        };
        if slot.is_some() {
            return;
        }

        let log: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.policy.purge_interval;

        *slot = Some(tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Provenance reclaimer started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => {
                        info!("Provenance reclaimer shutting down");
                        break;
                    }
                }

                let Some(log) = log.upgrade() else {
                    debug!("Provenance log dropped, reclaimer exiting");
                    break;
                };
                match tokio::task::spawn_blocking(move || log.purge()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!(error = %e, "Provenance purge failed"),
                    Err(e) => error!(error = %e, "Provenance purge task failed"),
                }
            }
        }));
    }

    /// Stop the reclaimer and wait for it to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.reclaimer.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Provenance reclaimer task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventDetail, ProvenanceEventType, RecordSnapshot};
    use edgeflow_core::clock::ManualClock;

    fn policy() -> RetentionPolicy {
        RetentionPolicy {
            max_age_ms: 60_000,
            max_storage_bytes: 10 * 1024 * 1024,
            purge_interval: Duration::from_millis(20),
        }
    }

    fn event_at(record: RecordId, ts: u64) -> ProvenanceEvent {
        ProvenanceEvent::new(
            ProvenanceEventType::Create,
            "gen",
            "GenerateRecords",
            RecordSnapshot::new(record),
            ts,
            EventDetail::default(),
        )
    }

    #[test]
    fn test_append_and_get() {
        let clock = Arc::new(ManualClock::new(0));
        let log = ProvenanceLog::in_memory(policy(), clock).unwrap();
        let event = event_at(RecordId::new(), 10);

        assert!(log.append(&event).unwrap());
        let loaded = log.get(&event.event_id()).unwrap().unwrap();
        assert_eq!(loaded, event);
    }

    #[test]
    fn test_append_is_idempotent_by_id() {
        let clock = Arc::new(ManualClock::new(0));
        let log = ProvenanceLog::in_memory(policy(), clock).unwrap();
        let event = event_at(RecordId::new(), 10);

        assert!(log.append(&event).unwrap());
        assert!(!log.append(&event).unwrap());
        assert_eq!(log.append_batch(&[event.clone(), event]).unwrap(), 0);
        assert_eq!(log.stats().unwrap().events, 1);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let clock = Arc::new(ManualClock::new(0));
        let log = ProvenanceLog::in_memory(policy(), clock).unwrap();
        assert!(log.get(&EventId::new()).unwrap().is_none());
    }

    #[test]
    fn test_events_for_record_in_time_order() {
        let clock = Arc::new(ManualClock::new(0));
        let log = ProvenanceLog::in_memory(policy(), clock).unwrap();
        let record = RecordId::new();
        let later = event_at(record, 20);
        let earlier = event_at(record, 10);
        let other = event_at(RecordId::new(), 15);
        log.append_batch(&[later.clone(), other, earlier.clone()]).unwrap();

        let events = log.events_for_record(&record).unwrap();
        assert_eq!(events, vec![earlier, later]);
    }

    #[test]
    fn test_recent_newest_first() {
        let clock = Arc::new(ManualClock::new(0));
        let log = ProvenanceLog::in_memory(policy(), clock).unwrap();
        for ts in [1, 3, 2] {
            log.append(&event_at(RecordId::new(), ts)).unwrap();
        }
        let recent = log.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp(), 3);
        assert_eq!(recent[1].timestamp(), 2);
    }

    #[test]
    fn test_purge_by_age() {
        let clock = Arc::new(ManualClock::new(100_000));
        let log = ProvenanceLog::in_memory(policy(), clock.clone()).unwrap();
        let old = event_at(RecordId::new(), 10_000);
        let fresh = event_at(RecordId::new(), 90_000);
        log.append_batch(&[old.clone(), fresh.clone()]).unwrap();

        assert_eq!(log.purge().unwrap(), 1);
        assert!(log.get(&old.event_id()).unwrap().is_none());
        assert!(log.get(&fresh.event_id()).unwrap().is_some());
    }

    #[test]
    fn test_purge_by_size_removes_oldest_first() {
        let clock = Arc::new(ManualClock::new(1_000));
        let events: Vec<_> = (0..4).map(|i| event_at(RecordId::new(), 900 + i)).collect();
        let one = events[0].encode().unwrap().len() as u64;

        let capped = RetentionPolicy {
            max_storage_bytes: one * 2,
            ..policy()
        };
        let log = ProvenanceLog::in_memory(capped, clock).unwrap();
        log.append_batch(&events).unwrap();

        let removed = log.purge().unwrap();
        assert_eq!(removed, 2);
        assert!(log.get(&events[0].event_id()).unwrap().is_none());
        assert!(log.get(&events[1].event_id()).unwrap().is_none());
        assert!(log.get(&events[3].event_id()).unwrap().is_some());
        assert!(log.stats().unwrap().bytes <= one * 2);
    }

    #[tokio::test]
    async fn test_reclaimer_runs_and_shuts_down() {
        let clock = Arc::new(ManualClock::new(0));
        let log = ProvenanceLog::in_memory(policy(), clock.clone()).unwrap();
        log.append(&event_at(RecordId::new(), 0)).unwrap();

        log.start_reclaimer();
        clock.set(120_000);
        tokio::time::sleep(Duration::from_millis(100)).await;
        log.shutdown().await;

        assert_eq!(log.stats().unwrap().events, 0);
    }

    #[tokio::test]
    async fn test_slow_purge_does_not_stall_runtime() {
        let clock = Arc::new(ManualClock::new(0));
        let log = ProvenanceLog::in_memory(policy(), clock.clone()).unwrap();
        log.append(&event_at(RecordId::new(), 0)).unwrap();
        clock.set(120_000);

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                let _conn = log.conn.lock().unwrap();
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(400));
            })
        };
        locked_rx.recv().unwrap();

        log.start_reclaimer();
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_millis(300));

        holder.join().unwrap();
        log.shutdown().await;
        assert_eq!(log.stats().unwrap().events, 0);
    }
}
