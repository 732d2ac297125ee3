use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use edgeflow_core::config::SchedulingConfig;
use edgeflow_core::types::ProcessorId;

use crate::connection::Connection;
use crate::context::ProcessContext;
use crate::processor::{Processor, ProcessorDescriptor};

/// Mutable scheduling state of one processor, shared between its context,
/// its scheduling loop and the connections feeding it.
#[derive(Debug, Default)]
pub struct ProcessorState {
    active: AtomicUsize,
    yield_until: AtomicU64,
    work: Arc<Notify>,
}

impl ProcessorState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn yield_until(&self) -> u64 {
        self.yield_until.load(Ordering::SeqCst)
    }

    pub(crate) fn set_yield_until(&self, until: u64) {
        self.yield_until.fetch_max(until, Ordering::SeqCst);
    }

    pub fn is_yielding(&self, now: u64) -> bool {
        self.yield_until() > now
    }

    pub(crate) fn work(&self) -> &Notify {
        &self.work
    }

    /// Handle given to the connections feeding this processor.
    pub(crate) fn work_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.work)
    }

    /// Claim an invocation slot. The slot is returned when the guard drops.
    pub(crate) fn begin(self: &Arc<Self>) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveGuard {
            state: Arc::clone(self),
        }
    }
}

/// Keeps a processor's active-task count raised for one invocation.
pub(crate) struct ActiveGuard {
    state: Arc<ProcessorState>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A processor's place in the graph: where it reads from and where each of
/// its relationships leads.
pub struct ProcessorPorts {
    pub(crate) id: ProcessorId,
    pub(crate) name: String,
    pub(crate) type_name: String,
    pub(crate) relationships: BTreeSet<String>,
    pub(crate) incoming: Vec<Arc<Connection>>,
    pub(crate) outgoing: BTreeMap<String, Vec<Arc<Connection>>>,
    pub(crate) auto_terminated: BTreeSet<String>,
    pub(crate) penalization_ms: u64,
    /// Round-robin start for multi-input `get`.
    pub(crate) cursor: AtomicUsize,
}

impl ProcessorPorts {
    pub fn id(&self) -> ProcessorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn incoming(&self) -> &[Arc<Connection>] {
        &self.incoming
    }

    pub fn outgoing(&self, relationship: &str) -> &[Arc<Connection>] {
        self.outgoing.get(relationship).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_auto_terminated(&self, relationship: &str) -> bool {
        self.auto_terminated.contains(relationship)
    }

    /// Any incoming connection has a head record that `get` could take at `now`.
    pub fn has_queued_work(&self, now: u64) -> bool {
        self.incoming.iter().any(|c| c.has_eligible_head(now))
    }
}

/// Arena entry for one processor.
pub(crate) struct ProcessorNode {
    pub(crate) processor: Arc<dyn Processor>,
    pub(crate) descriptor: ProcessorDescriptor,
    pub(crate) scheduling: SchedulingConfig,
    pub(crate) state: Arc<ProcessorState>,
    pub(crate) context: Arc<ProcessContext>,
    pub(crate) ports: Arc<ProcessorPorts>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_guard_releases_slot() {
        let state = ProcessorState::new();
        {
            let _a = state.begin();
            let _b = state.begin();
            assert_eq!(state.active(), 2);
        }
        assert_eq!(state.active(), 0);
    }

    #[test]
    fn test_yield_only_extends() {
        let state = ProcessorState::new();
        state.set_yield_until(100);
        state.set_yield_until(50);
        assert_eq!(state.yield_until(), 100);
        assert!(state.is_yielding(99));
        assert!(!state.is_yielding(100));
    }
}
