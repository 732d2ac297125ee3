/// Source of wall-clock time in epoch milliseconds.
///
/// Every timestamp the engine stamps onto records, queues and provenance
/// events comes from one injected clock, which is what lets tests drive
/// penalization and expiration deterministically.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> u64;
}
